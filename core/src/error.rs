//! Error types shared by every pure component.

use thiserror::Error;

/// Errors raised by the data model, calibration engine, mission sequencer
/// and mode-switcher state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdrError {
    /// A single-flight operation was already in progress.
    #[error("busy")]
    Busy,

    /// Requested record, tag, table or mission item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// State precondition unmet (e.g. StartRecord while Idle).
    #[error("denied: {0}")]
    Denied(String),

    /// CRC mismatch on page read.
    #[error("CRC mismatch on page {index}")]
    Corrupt { index: u32 },

    /// No implementation registered for the requested mode.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A conflicting long-running request is already in flight.
    #[error("in progress")]
    InProgress,

    /// Unclassified failure; carries a human-readable message.
    #[error("failed: {0}")]
    Failed(String),
}
