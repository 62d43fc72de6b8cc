//! Per-source ingestion progress.
//!
//! A checkpoint is the resume point of one source: the high-water-mark of
//! the last successful run plus the outcome of the most recent run. The
//! high-water-mark only ever moves forward, and only on success.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use crate::types::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_name: String,
    pub high_water_mark: Option<Timestamp>,
    pub last_status: RunStatus,
    pub records_processed: u64,
    pub run_duration_ms: u64,
    pub last_error: Option<String>,
}

/// Outcome of one run, written with `Store::upsert_checkpoint` or alongside a commit.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointUpdate {
    pub source_name: String,
    pub status: RunStatus,
    pub records_processed: u64,
    pub duration: Duration,
    pub error: Option<String>,
    /// Max timestamp accepted this run. Always `None` for failures.
    pub high_water_mark: Option<Timestamp>,
}

impl CheckpointUpdate {
    pub fn success(
        source_name: impl Into<String>,
        records_processed: u64,
        duration: Duration,
        high_water_mark: Option<Timestamp>,
    ) -> Self {
        CheckpointUpdate {
            source_name: source_name.into(),
            status: RunStatus::Success,
            records_processed,
            duration,
            error: None,
            high_water_mark,
        }
    }

    pub fn failure(source_name: impl Into<String>, duration: Duration, error: impl Into<String>) -> Self {
        CheckpointUpdate {
            source_name: source_name.into(),
            status: RunStatus::Failure,
            records_processed: 0,
            duration,
            error: Some(error.into()),
            high_water_mark: None,
        }
    }
}

impl Checkpoint {
    /// Upsert semantics: overwrite the run outcome in place, or create the row
    /// on a source's first run. The high-water-mark is advanced to
    /// `max(stored, update)` when the update carries one and kept otherwise.
    pub fn apply(existing: Option<Checkpoint>, update: &CheckpointUpdate) -> Checkpoint {
        let previous_mark = existing.as_ref().and_then(|cp| cp.high_water_mark);
        let high_water_mark = match (previous_mark, update.high_water_mark) {
            (Some(prev), Some(new)) => Some(prev.max(new)),
            (prev, new) => new.or(prev),
        };

        Checkpoint {
            source_name: update.source_name.clone(),
            high_water_mark,
            last_status: update.status,
            records_processed: update.records_processed,
            run_duration_ms: update.duration.as_millis() as u64,
            last_error: update.error.clone(),
        }
    }

    /// True when a record at `ts` was already covered by a successful run.
    pub fn covers(&self, ts: Timestamp) -> bool {
        self.high_water_mark.is_some_and(|mark| ts <= mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn first_run_creates_checkpoint() {
        let update = CheckpointUpdate::success("a", 3, Duration::from_millis(12), Some(ts(5)));
        let cp = Checkpoint::apply(None, &update);
        assert_eq!(cp.source_name, "a");
        assert_eq!(cp.high_water_mark, Some(ts(5)));
        assert_eq!(cp.records_processed, 3);
        assert_eq!(cp.run_duration_ms, 12);
    }

    #[test]
    fn failure_keeps_high_water_mark() {
        let ok = Checkpoint::apply(None, &CheckpointUpdate::success("a", 3, Duration::ZERO, Some(ts(5))));
        let failed = Checkpoint::apply(Some(ok), &CheckpointUpdate::failure("a", Duration::ZERO, "boom"));
        assert_eq!(failed.last_status, RunStatus::Failure);
        assert_eq!(failed.high_water_mark, Some(ts(5)));
        assert_eq!(failed.records_processed, 0);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn high_water_mark_never_moves_backwards() {
        let ok = Checkpoint::apply(None, &CheckpointUpdate::success("a", 1, Duration::ZERO, Some(ts(5))));
        let older = Checkpoint::apply(Some(ok), &CheckpointUpdate::success("a", 1, Duration::ZERO, Some(ts(2))));
        assert_eq!(older.high_water_mark, Some(ts(5)));
    }

    #[test]
    fn covers_is_inclusive() {
        let cp = Checkpoint::apply(None, &CheckpointUpdate::success("a", 1, Duration::ZERO, Some(ts(5))));
        assert!(cp.covers(ts(5)));
        assert!(cp.covers(ts(4)));
        assert!(!cp.covers(ts(6)));
    }
}
