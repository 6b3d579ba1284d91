//! Work Mode: the polymorphic per-mode analyzer
//! host and its factory. Concrete signal-processing math is named an
//! out-of-scope collaborator by `spec.md` §1 ("concrete analyzer
//! implementations (signal processing math)"), so the [`Analyzer`] trait's
//! `fill_measurement` is the seam a real DSP crate would plug into; the
//! [`ReferenceAnalyzer`] shipped here is the one enabled-by-default
//! implementation, filling deterministic placeholder measurement bytes the
//! way a bench/simulator analyzer would.
//!
//! The registry-of-constructors-by-name pattern mirrors the teacher's
//! per-brand controller dispatch (`mayara_core::controllers` maps a `Brand`
//! to a concrete `FurunoController`/`NavicoController`/...); here the key is
//! `(WorkModeKind, impl name)` instead of `Brand`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sdr_core::{SdrError, WorkModeKind};

/// Per-mode analyzer host. `init` is async because a real
/// analyzer opens a device or DSP pipeline; `fill_measurement` is
/// synchronous since it only touches the current sample's measurement
/// bytes, called once per tick from the switcher's single-flight section.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Initializes the analyzer for `frequency_hz`/`ref_power`, cancellable
    /// via `cancel` (linked to the switcher's shutdown token per spec §5).
    async fn init(&self, frequency_hz: u64, ref_power: f32, cancel: CancellationToken) -> Result<(), SdrError>;

    fn mode(&self) -> WorkModeKind;

    /// Latest signal-overflow observable; NaN when unknown.
    fn signal_overflow(&self) -> f32;

    /// Fills the mode-specific measurement bytes of one sample into `buf`.
    /// Calibration is applied by the caller to the measurement fields this
    /// writes, per spec §4.4 step (5) — the analyzer itself is
    /// calibration-agnostic.
    fn fill_measurement(&self, buf: &mut [u8]);
}

/// Deterministic reference analyzer: the one implementation this repo ships
/// enabled by default for every mode. Signal-processing math is out of
/// scope, so this fills a monotonically increasing counter into
/// the measurement bytes and reports a fixed, in-range overflow value —
/// enough for the switcher, record store and calibration lookup around it
/// to be exercised and tested end to end.
pub struct ReferenceAnalyzer {
    mode: WorkModeKind,
    overflow_millipercent: AtomicU32,
}

impl ReferenceAnalyzer {
    pub fn new(mode: WorkModeKind) -> Self {
        ReferenceAnalyzer {
            mode,
            overflow_millipercent: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Analyzer for ReferenceAnalyzer {
    async fn init(&self, _frequency_hz: u64, _ref_power: f32, _cancel: CancellationToken) -> Result<(), SdrError> {
        self.overflow_millipercent.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn mode(&self) -> WorkModeKind {
        self.mode
    }

    fn signal_overflow(&self) -> f32 {
        self.overflow_millipercent.load(Ordering::Relaxed) as f32 / 1000.0
    }

    fn fill_measurement(&self, buf: &mut [u8]) {
        let counter = self.overflow_millipercent.fetch_add(1, Ordering::Relaxed);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = counter.wrapping_add(i as u32) as u8;
        }
    }
}

type Constructor = fn() -> Arc<dyn Analyzer>;

/// Maps `(mode, impl name)` to a constructor. Unknown
/// mode on lookup is reported as `SdrError::Unsupported`.
#[derive(Default)]
pub struct AnalyzerRegistry {
    constructors: HashMap<(WorkModeKind, String), Constructor>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mode: WorkModeKind, name: impl Into<String>, constructor: Constructor) {
        self.constructors.insert((mode, name.into()), constructor);
    }

    /// The default registry: `ReferenceAnalyzer` registered under the name
    /// `"reference"` for every non-Idle mode.
    pub fn with_reference_analyzers() -> Self {
        let mut registry = Self::new();
        for mode in WorkModeKind::ALL_NON_IDLE {
            registry.register(mode, "reference", reference_constructor_for(mode));
        }
        registry
    }

    pub fn construct(&self, mode: WorkModeKind, name: &str) -> Result<Arc<dyn Analyzer>, SdrError> {
        self.constructors
            .get(&(mode, name.to_string()))
            .map(|ctor| ctor())
            .ok_or_else(|| SdrError::Unsupported(format!("{mode:?}/{name}")))
    }
}

fn reference_constructor_for(mode: WorkModeKind) -> Constructor {
    match mode {
        WorkModeKind::Llz => || Arc::new(ReferenceAnalyzer::new(WorkModeKind::Llz)),
        WorkModeKind::Gp => || Arc::new(ReferenceAnalyzer::new(WorkModeKind::Gp)),
        WorkModeKind::Vor => || Arc::new(ReferenceAnalyzer::new(WorkModeKind::Vor)),
        WorkModeKind::Idle => unreachable!("Idle has no analyzer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reference_analyzer_fills_deterministic_bytes() {
        let analyzer = ReferenceAnalyzer::new(WorkModeKind::Llz);
        analyzer.init(109_500_000, -40.0, CancellationToken::new()).await.unwrap();
        let mut buf = [0u8; 8];
        analyzer.fill_measurement(&mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(!analyzer.signal_overflow().is_nan());
    }

    #[test]
    fn registry_construct_unknown_mode_is_unsupported() {
        let registry = AnalyzerRegistry::with_reference_analyzers();
        let err = registry.construct(WorkModeKind::Llz, "nonexistent").unwrap_err();
        assert_eq!(err, SdrError::Unsupported("Llz/nonexistent".into()));
    }

    #[test]
    fn registry_constructs_registered_reference_impl() {
        let registry = AnalyzerRegistry::with_reference_analyzers();
        let analyzer = registry.construct(WorkModeKind::Gp, "reference").unwrap();
        assert_eq!(analyzer.mode(), WorkModeKind::Gp);
    }
}
