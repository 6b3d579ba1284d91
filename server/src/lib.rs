//! # sdr-server
//!
//! Async shell for the SDR payload controller: the Mode Switcher, Mission
//! Executor, Record Store, Calibration Store, Telemetry Source and MAVLink
//! link that drive the pure state machines in [`sdr_core`].
//!
//! ## Architecture
//!
//! `sdr_core` carries every transition table, invariant and piece of pure
//! bookkeeping with zero I/O and zero async; this crate is the collaborator
//! layer around it — file I/O, timers, channels, and the MAVLink wire link
//! — matching the split `sdr_core`'s own crate docs describe.
//!
//! | Module              | Responsibility |
//! |---------------------|----------------|
//! | [`config`]           | Recognized configuration keys and defaults |
//! | [`record_store`]     | File-backed record store (component B) |
//! | [`calibration_store`]| On-disk calibration tables (component C) |
//! | [`telemetry`]        | Telemetry Source async shell (component A) |
//! | [`analyzer`]         | Work Mode analyzer trait and registry (component D) |
//! | [`payload`]          | `ReadData` page composition |
//! | [`switcher_actor`]   | Mode Switcher async shell (component E) |
//! | [`mission_executor`] | Mission Executor async shell (component F) |
//! | [`mavlink_link`]     | MAVLink connection, command surface, request streams |
//! | [`error`]            | [`error::ServerError`], this crate's error type |
//!
//! ## Command-Line Interface
//!
//! See `main.rs`'s `Cli` for the binary's flags: `-v` for verbosity
//! (`clap-verbosity-flag`), `-c/--config` for the configuration file path,
//! `-a/--address` for the MAVLink connection string.

pub mod analyzer;
pub mod calibration_store;
pub mod config;
pub mod error;
pub mod mavlink_link;
pub mod mission_executor;
pub mod payload;
pub mod record_store;
pub mod switcher_actor;
pub mod telemetry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
