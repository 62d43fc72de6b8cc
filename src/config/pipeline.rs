use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::ingestion::drift::DEFAULT_SIMILARITY_THRESHOLD;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Abort every run once more than half its records are accepted.
    pub chaos_mode: bool,
    pub fetch_timeout_secs: u64,
    pub commit_timeout_secs: u64,
    pub drift_similarity_threshold: f64,
    /// Re-run the pass on this period when serving. Unset means manual triggers only.
    pub run_interval_secs: Option<u64>,
    pub run_on_startup: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            chaos_mode: false,
            fetch_timeout_secs: 120,
            commit_timeout_secs: 30,
            drift_similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            run_interval_secs: None,
            run_on_startup: true,
        }
    }
}

impl PipelineConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }

    pub fn run_interval(&self) -> Option<Duration> {
        self.run_interval_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}
