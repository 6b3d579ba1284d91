//! Mode Switcher async shell. Wraps the pure [`sdr_core::ModeSwitcher`] state machine with the
//! I/O side effects its transitions describe: constructing/disposing
//! analyzers, arming/disarming the cooperative sample-tick timer, opening
//! and finalizing record writers, and transmitting composed payloads over
//! the MAVLink link.
//!
//! Concurrency guarantees:
//! - a `tokio::sync::Mutex` (`state_mutex`) serializes `SetMode` against
//!   `StartRecord`/`StopRecord` — the one mutex guarding transitions, held
//!   across the awaits that dispose the old timer/analyzer and `init` the
//!   new one;
//! - the sample tick's single-flight gate is a bare `AtomicBool` compare-
//!   exchange, never a mutex held across an await; the pure
//!   `sdr_core::TickAccounting` counters are updated through brief,
//!   synchronous `std::sync::Mutex` critical sections that never span an
//!   `.await`;
//! - `StopRecord` awaits the busy flag clearing before dropping the writer,
//!   closing the race between a late in-flight tick and the writer handle
//!   disappearing out from under it (do not replicate the race: capturing
//!   the writer into a local and continuing to write after `StopRecord`
//!   clears the field).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sdr_core::{ModeSwitcher, RecordId, SdrError, SwitcherState, TickAccounting, WorkModeKind};

use crate::analyzer::{Analyzer, AnalyzerRegistry};
use crate::calibration_store::CalibrationStore;
use crate::config::Config;
use crate::error::ServerError;
use crate::payload;
use crate::record_store::{RecordStore, RecordWriter};
use crate::telemetry::TelemetrySource;

/// One composed sample, handed to the MAVLink link task for transmission
///`: the payload is
/// already fully populated by the time it reaches the channel, since this
/// crate's MAVLink encoding is a downstream collaborator rather than an
/// in-place builder callback).
#[derive(Debug, Clone)]
pub struct OutboundSample {
    pub mode: WorkModeKind,
    pub record_id: Option<RecordId>,
    pub page_index: u32,
    pub payload: [u8; sdr_core::PAGE_PAYLOAD_SIZE],
}

/// Outcome of a `SetMode` request.
#[derive(Debug, Clone, PartialEq)]
pub enum SetModeOutcome {
    Accepted,
    Unsupported(String),
}

/// Outcome of a `StartRecord` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRecordOutcome {
    Accepted(RecordId),
    Denied,
}

/// This repo's default calibration-table-to-mode binding: tables are
/// provisioned in `WorkModeKind::ALL_NON_IDLE` order (Llz=0, Gp=1, Vor=2).
/// Per-mode calibration lookup doesn't imply this index mapping on its own;
/// see `DESIGN.md` for the resolution.
fn calibration_index_for_mode(mode: WorkModeKind) -> Option<usize> {
    WorkModeKind::ALL_NON_IDLE.iter().position(|m| *m == mode)
}

struct ArmedTimer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Published heartbeat fields that the Switcher keeps current.
#[derive(Debug, Default)]
struct Published {
    ref_power_bits: AtomicU32,
    signal_overflow_bits: AtomicU32,
}

impl Published {
    fn set_ref_power(&self, value: f32) {
        self.ref_power_bits.store(value.to_bits(), Ordering::Relaxed);
    }
    fn ref_power(&self) -> f32 {
        f32::from_bits(self.ref_power_bits.load(Ordering::Relaxed))
    }
    fn set_signal_overflow(&self, value: f32) {
        self.signal_overflow_bits.store(value.to_bits(), Ordering::Relaxed);
    }
    fn signal_overflow(&self) -> f32 {
        f32::from_bits(self.signal_overflow_bits.load(Ordering::Relaxed))
    }
}

/// The async Mode Switcher actor.
pub struct Switcher {
    state_mutex: AsyncMutex<()>,
    core: StdMutex<ModeSwitcher>,
    busy: AtomicBool,
    analyzer: StdMutex<Option<Arc<dyn Analyzer>>>,
    analyzer_cancel: StdMutex<Option<CancellationToken>>,
    writer: StdMutex<Option<Arc<RecordWriter>>>,
    record_started_at_ms: StdMutex<Option<u64>>,
    record_page_counter: StdMutex<u64>,
    timer: StdMutex<Option<ArmedTimer>>,
    published: Published,

    registry: Arc<AnalyzerRegistry>,
    config: Arc<Config>,
    calibration: Arc<CalibrationStore>,
    record_store: Arc<RecordStore>,
    telemetry: Arc<TelemetrySource>,
    outbound: mpsc::Sender<OutboundSample>,
    shutdown: CancellationToken,
}

impl Switcher {
    pub fn new(
        registry: Arc<AnalyzerRegistry>,
        config: Arc<Config>,
        calibration: Arc<CalibrationStore>,
        record_store: Arc<RecordStore>,
        telemetry: Arc<TelemetrySource>,
        outbound: mpsc::Sender<OutboundSample>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Switcher {
            state_mutex: AsyncMutex::new(()),
            core: StdMutex::new(ModeSwitcher::new()),
            busy: AtomicBool::new(false),
            analyzer: StdMutex::new(None),
            analyzer_cancel: StdMutex::new(None),
            writer: StdMutex::new(None),
            record_started_at_ms: StdMutex::new(None),
            record_page_counter: StdMutex::new(0),
            timer: StdMutex::new(None),
            published: Published::default(),
            registry,
            config,
            calibration,
            record_store,
            telemetry,
            outbound,
            shutdown,
        })
    }

    pub fn state(&self) -> SwitcherState {
        self.core.lock().unwrap().state()
    }

    pub fn current_mode(&self) -> WorkModeKind {
        self.core.lock().unwrap().current_mode()
    }

    pub fn current_record(&self) -> Option<RecordId> {
        self.core.lock().unwrap().current_record()
    }

    pub fn ref_power(&self) -> f32 {
        self.published.ref_power()
    }

    pub fn signal_overflow(&self) -> f32 {
        self.published.signal_overflow()
    }

    pub fn supported_modes_bitmask(&self) -> u32 {
        WorkModeKind::ALL_NON_IDLE
            .iter()
            .filter(|m| self.config.enabled_analyzer(**m).is_some())
            .fold(0u32, |acc, m| acc | m.flag())
    }

    /// Accounting identity observable for diagnostics/tests.
    pub fn tick_counts(&self) -> (u64, u64, u64) {
        let core = self.core.lock().unwrap();
        (core.tick.skipped(), core.tick.errored(), core.tick.completed())
    }

    async fn wait_tick_idle(&self) {
        while self.busy.load(Ordering::Acquire) {
            tokio::task::yield_now().await;
        }
    }

    /// `SetMode(mode, frequencyHz, recordRate, sendingThinningRatio, refPower)`
    ///.
    pub async fn set_mode(
        self: &Arc<Self>,
        mode: WorkModeKind,
        frequency_hz: u64,
        rate_hz: f32,
        ratio: u32,
        ref_power: f32,
    ) -> Result<SetModeOutcome, ServerError> {
        let _guard = self.state_mutex.lock().await;

        let implementation_available = mode.is_idle() || self.config.enabled_analyzer(mode).is_some();

        self.wait_tick_idle().await;

        let effects = {
            let mut core = self.core.lock().unwrap();
            match core.set_mode(mode, frequency_hz, rate_hz, ratio, ref_power, implementation_available) {
                Ok(effects) => effects,
                Err(SdrError::Unsupported(name)) => return Ok(SetModeOutcome::Unsupported(name)),
                Err(other) => return Err(other.into()),
            }
        };

        if effects.record_to_close.is_some() {
            if let Err(e) = self.finalize_current_record() {
                log::error!("failed finalizing record on implicit StopRecord during SetMode: {e}");
            }
        }

        let old_analyzer_cancel = self.analyzer_cancel.lock().unwrap().take();
        if let Some(cancel) = old_analyzer_cancel {
            cancel.cancel();
        }
        *self.analyzer.lock().unwrap() = None;

        let old_timer = self.timer.lock().unwrap().take();
        if let Some(timer) = old_timer {
            timer.cancel.cancel();
            let _ = timer.handle.await;
        }

        if let Some(new_mode) = effects.analyzer_to_construct {
            let name = self
                .config
                .enabled_analyzer(new_mode)
                .ok_or_else(|| ServerError::Sdr(SdrError::Unsupported(format!("{new_mode:?}"))))?
                .to_string();
            let analyzer = self.registry.construct(new_mode, &name)?;
            self.calibration.set_mode(frequency_hz, ref_power);

            let analyzer_cancel = self.shutdown.child_token();
            analyzer.init(frequency_hz, ref_power, analyzer_cancel.clone()).await?;
            self.published.set_ref_power(ref_power);
            self.published.set_signal_overflow(analyzer.signal_overflow());

            *self.analyzer.lock().unwrap() = Some(analyzer);
            *self.analyzer_cancel.lock().unwrap() = Some(analyzer_cancel);

            let timer_cancel = self.shutdown.child_token();
            let this = self.clone();
            let period_ms = effects.tick_period_ms;
            let handle = tokio::spawn(async move { this.run_timer(period_ms, timer_cancel.clone()).await });
            *self.timer.lock().unwrap() = Some(ArmedTimer { handle, cancel: timer_cancel });
        } else {
            self.published.set_ref_power(0.0);
            self.published.set_signal_overflow(f32::NAN);
        }

        Ok(SetModeOutcome::Accepted)
    }

    /// `StartRecord(name)`: denied when mode is Idle.
    pub async fn start_record(self: &Arc<Self>, name: String, now_ms: u64) -> Result<StartRecordOutcome, ServerError> {
        let _guard = self.state_mutex.lock().await;

        let mode = self.core.lock().unwrap().current_mode();
        if mode.is_idle() {
            return Ok(StartRecordOutcome::Denied);
        }

        let id = RecordId(uuid::Uuid::new_v4().as_u128());
        let frequency_hz = { self.core.lock().unwrap().frequency_hz() };
        let writer = self.record_store.create_file(id, name, mode, frequency_hz)?;

        {
            let mut core = self.core.lock().unwrap();
            core.start_record(id)?;
        }
        *self.writer.lock().unwrap() = Some(Arc::new(writer));
        *self.record_started_at_ms.lock().unwrap() = Some(now_ms);
        *self.record_page_counter.lock().unwrap() = 0;

        Ok(StartRecordOutcome::Accepted(id))
    }

    /// `StopRecord()`: always `Accepted`, including the
    /// idempotent idle case (no-op).
    pub async fn stop_record(self: &Arc<Self>, now_ms: u64) -> Result<(), ServerError> {
        let _guard = self.state_mutex.lock().await;
        self.wait_tick_idle().await;
        self.finalize_current_record_at(now_ms)
    }

    fn finalize_current_record(&self) -> Result<(), ServerError> {
        let now_ms = self.telemetry.now_ms();
        self.finalize_current_record_at(now_ms)
    }

    fn finalize_current_record_at(&self, now_ms: u64) -> Result<(), ServerError> {
        let id = {
            let mut core = self.core.lock().unwrap();
            match core.stop_record() {
                Ok(id) => id,
                Err(_) => return Ok(()), // idempotent: nothing was recording
            }
        };
        let started_at_ms = self.record_started_at_ms.lock().unwrap().take();
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let duration_sec = started_at_ms.map(|started| now_ms.saturating_sub(started) as f64 / 1000.0).unwrap_or(0.0);
            writer.edit_metadata(|record| {
                record.duration_sec = duration_sec;
            })?;
            log::info!("finalized record {id} (duration {duration_sec:.3}s)");
        }
        Ok(())
    }

    /// `CurrentRecordSetTag(kind, name, value)`: denied when no
    /// record is open.
    pub fn current_record_set_tag(&self, kind: sdr_core::TagKind, name: &str, value: &[u8]) -> Result<sdr_core::TagId, ServerError> {
        let writer = self.writer.lock().unwrap().clone();
        match writer {
            Some(writer) => writer.write_tag(kind, name, value),
            None => Err(ServerError::Sdr(SdrError::Denied("no record open".into()))),
        }
    }

    /// `DeleteTag(tagId)` on the currently open record: denied when no record is open, same as `SetTag`.
    pub fn current_record_delete_tag(&self, tag_id: sdr_core::TagId) -> Result<(), ServerError> {
        let writer = self.writer.lock().unwrap().clone();
        match writer {
            Some(writer) => writer.delete_tag(tag_id),
            None => Err(ServerError::Sdr(SdrError::Denied("no record open".into()))),
        }
    }

    /// The cooperative, skip-missed-ticks timer loop: each
    /// firing spawns `run_tick` without awaiting it, so a slow tick doesn't
    /// block the next `interval.tick()` wakeup — the `busy` flag is what
    /// makes overlapping fires a no-op rather than a pile-up.
    async fn run_timer(self: Arc<Self>, period_ms: u64, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(period_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move { this.run_tick().await; });
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// One sample tick. Single-flight via
    /// `busy`; any error is counted, never propagated.
    async fn run_tick(self: Arc<Self>) {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            self.core.lock().unwrap().tick.record_skipped();
            return;
        }

        let start = Instant::now();
        match self.run_tick_inner().await {
            Ok(()) => self.core.lock().unwrap().tick.record_completed(),
            Err(e) => {
                log::warn!("sample tick error: {e}");
                self.core.lock().unwrap().tick.record_error();
            }
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.core.lock().unwrap().tick.exit(elapsed_ms);
        self.busy.store(false, Ordering::Release);
    }

    async fn run_tick_inner(self: &Arc<Self>) -> Result<(), ServerError> {
        let (mode, record_id, ratio) = {
            let core = self.core.lock().unwrap();
            (core.current_mode(), core.current_record(), core.ratio())
        };
        if mode.is_idle() {
            return Ok(());
        }
        let Some(analyzer) = self.analyzer.lock().unwrap().clone() else {
            return Ok(());
        };

        let index = self.core.lock().unwrap().tick.next_sample_index();
        let telemetry = self.telemetry.frame();
        let calibration_index = calibration_index_for_mode(mode);

        let writer = self.writer.lock().unwrap().clone();

        // `index` is the switcher-wide tick counter driving the thinning
        // ratio below; it starts advancing as soon as the timer arms on
        // `SetMode`, before any `StartRecord`. The on-disk page index has to
        // start at 0 for each record instead, or a tick landing in that
        // Active-but-not-recording window would open the file with a
        // nonzero first page and leave unwritten, CRC-failing pages below
        // it. `record_page_counter` is reset in `start_record` and only
        // advances while a writer is actually open.
        let page_index = if writer.is_some() {
            let mut counter = self.record_page_counter.lock().unwrap();
            let current = *counter as u32;
            *counter += 1;
            current
        } else {
            0
        };

        // No record open outside Recording state; stamp the zero sentinel id.
        let payload = payload::compose(page_index, record_id.unwrap_or(RecordId(0)), &telemetry, analyzer.as_ref(), &self.calibration, calibration_index)?;
        self.published.set_signal_overflow(analyzer.signal_overflow());

        if TickAccounting::should_send(ratio, index) {
            if let Some(writer) = &writer {
                writer.write(page_index, payload)?;
            }
            self.outbound
                .send(OutboundSample { mode, record_id, page_index, payload })
                .await
                .map_err(|_| ServerError::Mavlink("outbound channel closed".into()))?;
        } else if let Some(writer) = &writer {
            writer.write(page_index, payload)?;
        }

        Ok(())
    }

    /// Called on unrecoverable shutdown: disarms the timer and finalizes
    /// any open record without requiring a client `StopRecord`/`SetMode`.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let _guard = self.state_mutex.lock().await;
        self.wait_tick_idle().await;
        let timer = self.timer.lock().unwrap().take();
        if let Some(timer) = timer {
            timer.cancel.cancel();
            let _ = timer.handle.await;
        }
        let _ = self.finalize_current_record();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let mut config = Config::default();
        let mut impls = HashMap::new();
        impls.insert("reference".to_string(), true);
        config.analyzers.insert(WorkModeKind::Llz, impls.clone());
        config.analyzers.insert(WorkModeKind::Gp, impls);
        config
    }

    async fn test_switcher() -> (Arc<Switcher>, tempfile::TempDir, mpsc::Receiver<OutboundSample>) {
        let dir = tempfile::tempdir().unwrap();
        let record_store = RecordStore::open(dir.path().join("records"), 5_000).unwrap();
        let calibration = CalibrationStore::open(dir.path().join("calibration")).unwrap();
        let telemetry = Arc::new(TelemetrySource::new(10_000));
        let registry = Arc::new(AnalyzerRegistry::with_reference_analyzers());
        let (tx, rx) = mpsc::channel(64);
        let switcher = Switcher::new(registry, Arc::new(test_config()), calibration, record_store, telemetry, tx, CancellationToken::new());
        (switcher, dir, rx)
    }

    #[tokio::test]
    async fn set_mode_unsupported_for_unconfigured_mode() {
        let (switcher, _dir, _rx) = test_switcher().await;
        let outcome = switcher.set_mode(WorkModeKind::Vor, 1, 10.0, 1, 0.0).await.unwrap();
        assert_eq!(outcome, SetModeOutcome::Unsupported("Vor".into()));
    }

    #[tokio::test]
    async fn start_record_denied_while_idle() {
        let (switcher, _dir, _rx) = test_switcher().await;
        let outcome = switcher.start_record("x".into(), 0).await.unwrap();
        assert_eq!(outcome, StartRecordOutcome::Denied);
    }

    #[tokio::test]
    async fn full_lifecycle_runs_ticks_and_finalizes_record() {
        let (switcher, _dir, mut rx) = test_switcher().await;
        switcher.set_mode(WorkModeKind::Llz, 109_500_000, 50.0, 1, -40.0).await.unwrap();
        assert_eq!(switcher.current_mode(), WorkModeKind::Llz);

        let outcome = switcher.start_record("flight-01".into(), 0).await.unwrap();
        let id = match outcome {
            StartRecordOutcome::Accepted(id) => id,
            _ => panic!("expected accepted"),
        };

        let sample = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(sample.record_id, Some(id));

        switcher.stop_record(1_000).await.unwrap();
        assert_eq!(switcher.current_mode(), WorkModeKind::Llz);
        assert!(switcher.current_record().is_none());

        switcher.set_mode(WorkModeKind::Idle, 0, 0.0, 1, 0.0).await.unwrap();
        assert_eq!(switcher.current_mode(), WorkModeKind::Idle);

        let (_skipped, _errored, completed) = switcher.tick_counts();
        assert!(completed >= 1);
    }

    #[tokio::test]
    async fn record_page_count_ignores_ticks_before_start_record() {
        let (switcher, _dir, mut rx) = test_switcher().await;
        switcher.set_mode(WorkModeKind::Llz, 109_500_000, 1000.0, 1, -40.0).await.unwrap();

        // Let at least one tick land while merely Active, before any record
        // is open -- this used to leak into the on-disk page index.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await;

        let outcome = switcher.start_record("flight-02".into(), 0).await.unwrap();
        let id = match outcome {
            StartRecordOutcome::Accepted(id) => id,
            _ => panic!("expected accepted"),
        };

        let sample = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(sample.page_index, 0);

        switcher.stop_record(1_000).await.unwrap();
        let record = switcher.record_store.try_get_entry(id).unwrap();
        assert_eq!(record.page_count, 1);
    }
}
