//! # sdr-core
//!
//! Platform-independent core of an SDR payload controller for an unmanned
//! aerial vehicle: the data model, the calibration engine's lookup logic,
//! the mission sequencer, and the Device Mode Switcher state machine.
//!
//! This crate has **zero I/O dependencies** — no `tokio`, no filesystem, no
//! MAVLink wire codec — so every state transition is a pure function driven
//! by explicit time and input parameters. The async shell in `sdr-server`
//! drives these machines and performs the I/O they describe as side effects.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  sdr-core (no tokio, no fs, no mavlink wire types)           │
//! │  ├── record       (RecordId/Page/Tag data model + CRC32Q)   │
//! │  ├── work_mode     (WorkModeKind, telemetry snapshot shapes) │
//! │  ├── calibration   (piecewise-linear adjustment tables)      │
//! │  ├── mission       (declarative plan + sequencer)            │
//! │  ├── switcher      (Mode Switcher state machine)             │
//! │  └── telemetry     (link-state machine)                      │
//! └──────────────────────────────────────────────────────────────┘
//!                 ▲
//!    ┌────────────┴────────────┐
//!    │  sdr-server             │
//!    │  (tokio, mavlink, fs)   │
//!    └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`record`] — Record/Page/Tag data model and the CRC-32Q page format.
//! - [`work_mode`] — work-mode identity and telemetry snapshot zero-fill rules.
//! - [`calibration`] — piecewise-linear calibration table selection and lookup.
//! - [`mission`] — mission plan data model and pure sequencing.
//! - [`switcher`] — the Mode Switcher state machine (component E).
//! - [`telemetry`] — the telemetry link three-state indicator (component A).
//! - [`error`] — [`SdrError`], the shared error enum.

pub mod calibration;
pub mod error;
pub mod mission;
pub mod record;
pub mod switcher;
pub mod telemetry;
pub mod work_mode;

pub use calibration::{CalibrationEngine, CalibrationRow, CalibrationTable};
pub use error::SdrError;
pub use mission::{Mission, MissionCommand, MissionItem, MissionSequencer, MissionState, StartOutcome};
pub use record::{Page, Record, RecordId, Tag, TagId, TagKind, PAGE_PAYLOAD_SIZE, PAGE_SIZE};
pub use switcher::{ModeSwitcher, SetModeEffects, SwitcherState, TickAccounting};
pub use telemetry::{LinkPoll, LinkState, TelemetryLink, WaypointTracker};
pub use work_mode::{AttitudeSnapshot, GlobalPositionSnapshot, GnssFixType, GnssSnapshot, TelemetryFrame, WorkModeKind};
