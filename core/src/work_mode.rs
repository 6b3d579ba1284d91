//! Work-mode identity and the telemetry snapshot shapes `ReadData` composes
//! from. Concrete analyzer implementations are an explicit
//! collaborator, out of scope here; this module only carries what is pure
//! data: which modes exist, their bitmask flags, and the zero-fill rules for
//! telemetry fields when a snapshot is absent.

use serde::{Deserialize, Serialize};

/// The enum of work modes. `Idle` is the switcher's resting state and is
/// never itself analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkModeKind {
    Idle,
    Llz,
    Gp,
    Vor,
}

impl WorkModeKind {
    /// Bit used in the `SupportedModes` heartbeat bitmask. `Idle`
    /// carries no bit of its own since it is the absence of any mode.
    pub fn flag(&self) -> u32 {
        match self {
            WorkModeKind::Idle => 0,
            WorkModeKind::Llz => 1 << 0,
            WorkModeKind::Gp => 1 << 1,
            WorkModeKind::Vor => 1 << 2,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, WorkModeKind::Idle)
    }

    pub const ALL_NON_IDLE: [WorkModeKind; 3] = [WorkModeKind::Llz, WorkModeKind::Gp, WorkModeKind::Vor];
}

/// GNSS fix quality, zero-filled to `NoGps` when no telemetry snapshot is
/// available yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GnssFixType {
    #[default]
    NoGps,
    Fix2d,
    Fix3d,
    Dgps,
    Rtk,
}

/// Raw GNSS fix, latitude/longitude in 1e7 degrees, altitude in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GnssSnapshot {
    pub fix_type: GnssFixType,
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub alt_mm: i32,
    pub satellites_visible: u8,
}

/// Vehicle attitude, radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AttitudeSnapshot {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Fused global position estimate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalPositionSnapshot {
    pub lat_e7: i32,
    pub lon_e7: i32,
    pub alt_mm: i32,
    pub relative_alt_mm: i32,
}

/// Everything `ReadData` stamps into a page before the analyzer
/// fills the remaining signal-measurement bytes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetryFrame {
    pub gnss: Option<GnssSnapshot>,
    pub attitude: Option<AttitudeSnapshot>,
    pub global_position: Option<GlobalPositionSnapshot>,
}

impl TelemetryFrame {
    /// Zero-filled values for sample construction: absent snapshots become
    /// all-zero fields, with GNSS fix type forced to `NoGps`.
    pub fn gnss_or_zero(&self) -> GnssSnapshot {
        self.gnss.unwrap_or_default()
    }

    pub fn attitude_or_zero(&self) -> AttitudeSnapshot {
        self.attitude.unwrap_or_default()
    }

    pub fn global_position_or_zero(&self) -> GlobalPositionSnapshot {
        self.global_position.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_modes_bitmask_ors_flags() {
        let mask = WorkModeKind::ALL_NON_IDLE.iter().fold(0u32, |acc, m| acc | m.flag());
        assert_eq!(mask, 0b111);
        assert_eq!(WorkModeKind::Idle.flag(), 0);
    }

    #[test]
    fn absent_telemetry_zero_fills() {
        let frame = TelemetryFrame::default();
        assert_eq!(frame.gnss_or_zero().fix_type, GnssFixType::NoGps);
        assert_eq!(frame.attitude_or_zero(), AttitudeSnapshot::default());
    }
}
