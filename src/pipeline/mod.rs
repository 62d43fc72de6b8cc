//! Per-source run state machine and the fan-out over all sources.
//!
//! ```text
//! Idle -> Fetching -> Filtering -> Merging -> Committing -> Succeeded
//!            \            \           \            \
//!             +------------+-----------+------------+--> Failed
//! ```
//!
//! A run either commits every merged entity together with its success
//! checkpoint, or commits nothing and records a failure checkpoint that
//! leaves the high-water-mark where it was.

pub mod orchestrator;
pub mod run;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use crate::controls::FaultInjection;
use crate::ingestion::DriftDetector;
use crate::store::Store;

pub use orchestrator::Orchestrator;
pub use run::SourceRun;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a run needs besides its adapter. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn Store>,
    pub faults: FaultInjection,
    pub drift: DriftDetector,
    /// Bounds the whole retried fetch, backoff included.
    pub fetch_timeout: Duration,
    pub commit_timeout: Duration,
}

impl PipelineContext {
    pub fn new(store: Arc<dyn Store>) -> Self {
        PipelineContext {
            store,
            faults: FaultInjection::default(),
            drift: DriftDetector::default(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }

    pub fn with_faults(mut self, faults: FaultInjection) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_drift(mut self, drift: DriftDetector) -> Self {
        self.drift = drift;
        self
    }

    pub fn with_timeouts(mut self, fetch: Duration, commit: Duration) -> Self {
        self.fetch_timeout = fetch;
        self.commit_timeout = commit;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Filtering,
    Merging,
    Committing,
    Succeeded,
    Failed,
    /// Not started because the same source already had a run in flight.
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Skipped)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunOutcome {
    pub source: String,
    pub state: RunState,
    pub records_processed: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }
}

/// Result of one pass over every registered source.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineReport {
    pub outcomes: Vec<RunOutcome>,
}

impl PipelineReport {
    pub fn outcome(&self, source: &str) -> Option<&RunOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }

    pub fn count(&self, state: RunState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(RunOutcome::succeeded)
    }

    pub fn records_processed(&self) -> u64 {
        self.outcomes.iter().map(|o| o.records_processed).sum()
    }
}
