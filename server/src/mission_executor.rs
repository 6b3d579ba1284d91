//! Mission Executor async shell: drives the pure
//! [`sdr_core::MissionSequencer`] against the Mode Switcher and Telemetry
//! Source, one item at a time, in a cancellable background task — the same
//! "pure bookkeeping type + async driver task" split the Mode Switcher
//! itself uses between `sdr_core::ModeSwitcher` and `switcher_actor::Switcher`.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sdr_core::{Mission, MissionCommand, MissionSequencer, MissionState, StartOutcome};

use crate::error::ServerError;
use crate::switcher_actor::Switcher;
use crate::telemetry::TelemetrySource;

pub struct MissionExecutor {
    sequencer: StdMutex<MissionSequencer>,
    mission: StdMutex<Option<Mission>>,
    run_cancel: StdMutex<Option<CancellationToken>>,
    run_handle: StdMutex<Option<JoinHandle<()>>>,
    switcher: Arc<Switcher>,
    telemetry: Arc<TelemetrySource>,
    shutdown: CancellationToken,
}

impl MissionExecutor {
    pub fn new(switcher: Arc<Switcher>, telemetry: Arc<TelemetrySource>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(MissionExecutor {
            sequencer: StdMutex::new(MissionSequencer::new()),
            mission: StdMutex::new(None),
            run_cancel: StdMutex::new(None),
            run_handle: StdMutex::new(None),
            switcher,
            telemetry,
            shutdown,
        })
    }

    pub fn state(&self) -> MissionState {
        self.sequencer.lock().unwrap().state()
    }

    pub fn current_index(&self) -> Option<u16> {
        self.sequencer.lock().unwrap().current_index()
    }

    /// `UploadMission(items)`: replaces the stored plan wholesale,
    /// validated for dense, zero-based `seq`.
    pub fn upload_mission(&self, mission: Mission) -> Result<(), ServerError> {
        mission.validate()?;
        *self.mission.lock().unwrap() = Some(mission);
        Ok(())
    }

    /// `StartMission(index)`: idempotent while already running.
    pub fn start_mission(self: &Arc<Self>, index: u16) -> Result<StartOutcome, ServerError> {
        let mission = self
            .mission
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ServerError::Sdr(sdr_core::SdrError::NotFound("no mission uploaded".into())))?;

        let outcome = self.sequencer.lock().unwrap().start(&mission, index)?;
        if outcome == StartOutcome::Started {
            let cancel = self.shutdown.child_token();
            let this = self.clone();
            let handle = tokio::spawn(async move { this.run(mission, cancel.clone()).await });
            *self.run_cancel.lock().unwrap() = Some(cancel);
            *self.run_handle.lock().unwrap() = Some(handle);
        }
        Ok(outcome)
    }

    /// `StopMission()`: idempotent from Idle.
    pub async fn stop_mission(self: &Arc<Self>) {
        self.sequencer.lock().unwrap().stop();
        let cancel = self.run_cancel.lock().unwrap().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let handle = self.run_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>, mission: Mission, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(index) = self.sequencer.lock().unwrap().current_index() else {
                return;
            };
            let Some(item) = mission.item(index) else {
                log::error!("mission item {index} vanished mid-run");
                self.sequencer.lock().unwrap().fail();
                return;
            };

            match self.dispatch(&item.command, &cancel).await {
                Ok(DispatchOutcome::Continue) => {
                    self.sequencer.lock().unwrap().advance(&mission);
                }
                Ok(DispatchOutcome::Cancelled) => return,
                Err(e) => {
                    log::error!("mission item {index} failed: {e}");
                    self.sequencer.lock().unwrap().fail();
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, command: &MissionCommand, cancel: &CancellationToken) -> Result<DispatchOutcome, ServerError> {
        match command {
            MissionCommand::SetMode { mode, frequency_hz, rate_hz, ratio, ref_power } => {
                let outcome = self.switcher.set_mode(*mode, *frequency_hz, *rate_hz, *ratio, *ref_power).await?;
                match outcome {
                    crate::switcher_actor::SetModeOutcome::Accepted => Ok(DispatchOutcome::Continue),
                    crate::switcher_actor::SetModeOutcome::Unsupported(name) => Err(ServerError::Sdr(sdr_core::SdrError::Unsupported(name))),
                }
            }
            MissionCommand::StartRecord { name } => {
                let now_ms = self.telemetry.now_ms();
                let outcome = self.switcher.start_record(name.clone(), now_ms).await?;
                match outcome {
                    crate::switcher_actor::StartRecordOutcome::Accepted(_) => Ok(DispatchOutcome::Continue),
                    crate::switcher_actor::StartRecordOutcome::Denied => Err(ServerError::Sdr(sdr_core::SdrError::Denied("StartRecord denied while Idle".into()))),
                }
            }
            MissionCommand::StopRecord => {
                let now_ms = self.telemetry.now_ms();
                self.switcher.stop_record(now_ms).await?;
                Ok(DispatchOutcome::Continue)
            }
            MissionCommand::SetRecordTag { kind, name, value } => {
                self.switcher.current_record_set_tag(*kind, name, value)?;
                Ok(DispatchOutcome::Continue)
            }
            MissionCommand::Delay { milliseconds } => {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(*milliseconds)) => Ok(DispatchOutcome::Continue),
                    _ = cancel.cancelled() => Ok(DispatchOutcome::Cancelled),
                }
            }
            MissionCommand::WaitVehicleWaypoint { requested_index } => {
                let mut rx = self.telemetry.subscribe_waypoints();
                if *rx.borrow() == Some(*requested_index) {
                    return Ok(DispatchOutcome::Continue);
                }
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return Ok(DispatchOutcome::Cancelled);
                            }
                            if *rx.borrow() == Some(*requested_index) {
                                return Ok(DispatchOutcome::Continue);
                            }
                        }
                        _ = cancel.cancelled() => return Ok(DispatchOutcome::Cancelled),
                    }
                }
            }
            MissionCommand::Other(name) => {
                log::warn!("skipping unrecognized mission command {name:?}");
                Ok(DispatchOutcome::Continue)
            }
        }
    }
}

enum DispatchOutcome {
    Continue,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdr_core::{MissionItem, TagKind, WorkModeKind};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn two_item_mission() -> Mission {
        Mission {
            items: vec![
                MissionItem {
                    seq: 0,
                    command: MissionCommand::SetMode { mode: WorkModeKind::Llz, frequency_hz: 1, rate_hz: 50.0, ratio: 1, ref_power: 0.0 },
                },
                MissionItem { seq: 1, command: MissionCommand::StopRecord },
            ],
        }
    }

    async fn test_executor() -> (Arc<MissionExecutor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let record_store = crate::record_store::RecordStore::open(dir.path().join("records"), 5_000).unwrap();
        let calibration = crate::calibration_store::CalibrationStore::open(dir.path().join("calibration")).unwrap();
        let telemetry = Arc::new(TelemetrySource::new(10_000));
        let registry = Arc::new(crate::analyzer::AnalyzerRegistry::with_reference_analyzers());
        let mut config = crate::config::Config::default();
        let mut impls = HashMap::new();
        impls.insert("reference".to_string(), true);
        config.analyzers.insert(WorkModeKind::Llz, impls);
        let (tx, _rx) = mpsc::channel(64);
        let switcher = Switcher::new(registry, Arc::new(config), calibration, record_store, telemetry.clone(), tx, CancellationToken::new());
        let executor = MissionExecutor::new(switcher, telemetry, CancellationToken::new());
        (executor, dir)
    }

    #[tokio::test]
    async fn start_without_upload_is_not_found() {
        let (executor, _dir) = test_executor().await;
        assert!(executor.start_mission(0).is_err());
    }

    #[tokio::test]
    async fn uploads_and_runs_to_completion() {
        let (executor, _dir) = test_executor().await;
        executor.upload_mission(two_item_mission()).unwrap();
        let outcome = executor.start_mission(0).unwrap();
        assert_eq!(outcome, StartOutcome::Started);

        for _ in 0..50 {
            if executor.state() == MissionState::Idle {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(executor.state(), MissionState::Idle);
        assert_eq!(executor.current_index(), None);
    }

    #[tokio::test]
    async fn unrecognized_command_is_skipped_not_failed() {
        let mission = Mission {
            items: vec![MissionItem { seq: 0, command: MissionCommand::Other("future_command".into()) }],
        };
        let (executor, _dir) = test_executor().await;
        executor.upload_mission(mission).unwrap();
        executor.start_mission(0).unwrap();

        for _ in 0..50 {
            if executor.state() == MissionState::Idle {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(executor.state(), MissionState::Idle);
    }

    #[tokio::test]
    async fn set_record_tag_without_open_record_fails_mission() {
        let mission = Mission {
            items: vec![MissionItem {
                seq: 0,
                command: MissionCommand::SetRecordTag { kind: TagKind::String, name: "note".into(), value: b"x".to_vec() },
            }],
        };
        let (executor, _dir) = test_executor().await;
        executor.upload_mission(mission).unwrap();
        executor.start_mission(0).unwrap();

        for _ in 0..50 {
            if executor.state() != MissionState::InProgress {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(executor.state(), MissionState::Error);
    }
}
