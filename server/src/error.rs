//! Server-layer error type. Wraps the pure [`sdr_core::SdrError`] kinds and
//! converts I/O-layer failures into `Failed`, following the teacher's
//! `From<bincode::Error> for ParseError` pattern (`core/src/error.rs`).

use sdr_core::SdrError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Sdr(#[from] SdrError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("mavlink error: {0}")]
    Mavlink(String),
}

impl From<ServerError> for SdrError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Sdr(e) => e,
            ServerError::Io(e) => SdrError::Failed(e.to_string()),
            ServerError::Json(e) => SdrError::Failed(e.to_string()),
            ServerError::Mavlink(msg) => SdrError::Failed(msg),
        }
    }
}
