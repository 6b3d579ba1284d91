//! Mission data model and pure sequencing.
//! Dispatching each item against the Mode Switcher / Telemetry Source is an
//! async, I/O-bound concern that lives in the server crate; this module only
//! holds the declarative plan and the current-index bookkeeping.

use serde::{Deserialize, Serialize};

use crate::error::SdrError;
use crate::record::TagKind;
use crate::work_mode::WorkModeKind;

/// One mission-script command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MissionCommand {
    SetMode {
        mode: WorkModeKind,
        frequency_hz: u64,
        rate_hz: f32,
        ratio: u32,
        ref_power: f32,
    },
    StartRecord {
        name: String,
    },
    StopRecord,
    SetRecordTag {
        kind: TagKind,
        name: String,
        value: Vec<u8>,
    },
    Delay {
        milliseconds: u64,
    },
    WaitVehicleWaypoint {
        requested_index: u16,
    },
    /// Any command name the executor doesn't recognize; logged and skipped.
    Other(String),
}

/// One entry in a mission's ordered sequence. `seq` is unique and dense
/// from zero across the whole mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionItem {
    pub seq: u16,
    pub command: MissionCommand,
}

/// A complete, validated mission plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mission {
    pub items: Vec<MissionItem>,
}

impl Mission {
    /// Validates `seq` is unique and dense from zero.
    pub fn validate(&self) -> Result<(), SdrError> {
        let mut seqs: Vec<u16> = self.items.iter().map(|i| i.seq).collect();
        seqs.sort_unstable();
        for (expected, actual) in seqs.iter().enumerate() {
            if expected as u16 != *actual {
                return Err(SdrError::Failed(format!(
                    "mission seq not dense from zero: expected {expected}, found {actual}"
                )));
            }
        }
        Ok(())
    }

    pub fn item(&self, seq: u16) -> Option<&MissionItem> {
        self.items.iter().find(|i| i.seq == seq)
    }
}

/// Mission executor run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionState {
    Idle,
    InProgress,
    Error,
}

/// Pure current-index/state bookkeeping for the mission executor. The
/// actual dispatch loop (awaiting delays, waypoints, delegating to the mode
/// switcher) is driven by the server crate; this type only tracks what index
/// is active and whether starting/stopping is legal right now.
#[derive(Debug, Default)]
pub struct MissionSequencer {
    state: MissionState,
    current_index: Option<u16>,
}

impl Default for MissionState {
    fn default() -> Self {
        MissionState::Idle
    }
}

/// Outcome of attempting to start a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyInProgress,
}

impl MissionSequencer {
    pub fn new() -> Self {
        MissionSequencer {
            state: MissionState::Idle,
            current_index: None,
        }
    }

    pub fn state(&self) -> MissionState {
        self.state
    }

    pub fn current_index(&self) -> Option<u16> {
        self.current_index
    }

    /// `StartMission(index)`: fails if `index` doesn't exist in `mission`,
    /// is idempotent while already in progress.
    pub fn start(&mut self, mission: &Mission, index: u16) -> Result<StartOutcome, SdrError> {
        if self.state == MissionState::InProgress {
            return Ok(StartOutcome::AlreadyInProgress);
        }
        if mission.item(index).is_none() {
            return Err(SdrError::NotFound(format!("mission item {index}")));
        }
        self.state = MissionState::InProgress;
        self.current_index = Some(index);
        Ok(StartOutcome::Started)
    }

    /// `StopMission`: idle state is idempotent.
    pub fn stop(&mut self) {
        self.state = MissionState::Idle;
        self.current_index = None;
    }

    /// Advance to the next dense seq, or finish to Idle if none exists.
    pub fn advance(&mut self, mission: &Mission) {
        let Some(current) = self.current_index else {
            return;
        };
        let next = current + 1;
        if mission.item(next).is_some() {
            self.current_index = Some(next);
        } else {
            self.state = MissionState::Idle;
            self.current_index = None;
        }
    }

    /// Any item error transitions to Error and halts; a fresh StartMission
    /// is rejected until StopMission is called.
    pub fn fail(&mut self) {
        self.state = MissionState::Error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_item_mission() -> Mission {
        Mission {
            items: vec![
                MissionItem { seq: 0, command: MissionCommand::StartRecord { name: "m0".into() } },
                MissionItem { seq: 1, command: MissionCommand::StopRecord },
            ],
        }
    }

    #[test]
    fn validate_rejects_non_dense_seq() {
        let mission = Mission {
            items: vec![MissionItem { seq: 0, command: MissionCommand::StopRecord }, MissionItem { seq: 2, command: MissionCommand::StopRecord }],
        };
        assert!(mission.validate().is_err());
    }

    #[test]
    fn start_unknown_index_is_not_found() {
        let mission = two_item_mission();
        let mut seq = MissionSequencer::new();
        assert!(seq.start(&mission, 5).is_err());
    }

    #[test]
    fn start_is_idempotent_while_in_progress() {
        let mission = two_item_mission();
        let mut seq = MissionSequencer::new();
        assert_eq!(seq.start(&mission, 0).unwrap(), StartOutcome::Started);
        assert_eq!(seq.start(&mission, 1).unwrap(), StartOutcome::AlreadyInProgress);
        assert_eq!(seq.current_index(), Some(0));
    }

    #[test]
    fn advance_finishes_to_idle_after_last_item() {
        let mission = two_item_mission();
        let mut seq = MissionSequencer::new();
        seq.start(&mission, 0).unwrap();
        seq.advance(&mission);
        assert_eq!(seq.current_index(), Some(1));
        seq.advance(&mission);
        assert_eq!(seq.state(), MissionState::Idle);
        assert_eq!(seq.current_index(), None);
    }

    #[test]
    fn stop_is_idempotent_from_idle() {
        let mut seq = MissionSequencer::new();
        seq.stop();
        assert_eq!(seq.state(), MissionState::Idle);
    }
}
