use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Chaos toggle. When enabled, a run aborts once more than half of its
/// candidate records have been accepted, to prove that nothing from a
/// failed run is ever committed.
///
/// Clones share the same flag, so a handle kept by the API or a test can
/// flip it for the orchestrator that owns another clone.
#[derive(Clone, Debug, Default)]
pub struct FaultInjection {
    enabled: Arc<AtomicBool>,
}

impl FaultInjection {
    pub fn new(enabled: bool) -> Self {
        FaultInjection {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::warn!("Fault injection ENABLED");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Fault injection DISABLED");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// True once `accepted` exceeds half of `candidates`.
    pub fn should_abort(armed: bool, accepted: usize, candidates: usize) -> bool {
        armed && accepted * 2 > candidates
    }
}
