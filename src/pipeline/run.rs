use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use crate::checkpoint::CheckpointUpdate;
use crate::controls::FaultInjection;
use crate::error::{Error, Result};
use crate::ingestion::{retry, SourceAdapter};
use crate::observability::metrics::{record_run_end, record_run_start, record_validation_failure};
use crate::pipeline::{PipelineContext, RunOutcome, RunState};
use crate::types::{NormalizedRecord, Timestamp};
use crate::unify::MergeBatch;

/// One source, one pass: fetch, filter, merge, commit. Strictly sequential.
pub struct SourceRun {
    ctx: PipelineContext,
    adapter: Arc<dyn SourceAdapter>,
    state: RunState,
    started: Instant,
}

/// What the filtering phase keeps.
struct Accepted {
    records: Vec<NormalizedRecord>,
    high_water_mark: Option<Timestamp>,
}

impl SourceRun {
    pub fn new(ctx: PipelineContext, adapter: Arc<dyn SourceAdapter>) -> Self {
        SourceRun {
            ctx,
            adapter,
            state: RunState::Idle,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(source = %self.adapter.name(), from = ?self.state, to = ?next, "Run state");
        self.state = next;
    }

    /// Never fails: every error ends the run in `Failed` with a failure checkpoint.
    pub async fn execute(mut self) -> RunOutcome {
        let source = self.name().to_string();
        self.started = Instant::now();
        record_run_start(&source);
        tracing::info!(source = %source, "etl_start");

        let result = self.run_phases().await;
        let duration = self.started.elapsed();

        match result {
            Ok(records_processed) => {
                self.transition(RunState::Succeeded);
                record_run_end(&source, true, records_processed, duration);
                tracing::info!(
                    source = %source,
                    records = records_processed,
                    duration_ms = duration.as_millis() as u64,
                    "etl_success"
                );
                RunOutcome {
                    source,
                    state: self.state,
                    records_processed,
                    duration_ms: duration.as_millis() as u64,
                    error: None,
                }
            }
            Err(e) => {
                self.transition(RunState::Failed);
                let error = e.to_string();
                tracing::error!(source = %source, error = %error, "etl_failure");

                let update = CheckpointUpdate::failure(source.as_str(), duration, error.as_str());
                if let Err(store_err) = self.ctx.store.upsert_checkpoint(update).await {
                    tracing::error!(source = %source, error = %store_err, "Failure checkpoint not recorded");
                }
                record_run_end(&source, false, 0, duration);

                RunOutcome {
                    source,
                    state: self.state,
                    records_processed: 0,
                    duration_ms: duration.as_millis() as u64,
                    error: Some(error),
                }
            }
        }
    }

    /// Returns the number of records merged and committed.
    async fn run_phases(&mut self) -> Result<u64> {
        self.transition(RunState::Fetching);
        let checkpoint = self.ctx.store.checkpoint(self.name()).await?;

        let policy = self.adapter.retry_policy();
        let adapter = Arc::clone(&self.adapter);
        let output = timeout(
            self.ctx.fetch_timeout,
            retry(&policy, adapter.name(), || adapter.fetch()),
        )
        .await
        .map_err(|_| Error::Timeout(self.ctx.fetch_timeout))??;
        tracing::info!(source = %self.name(), count = output.len(), "fetched_records");

        self.transition(RunState::Filtering);
        if let Some(first) = output.records.first() {
            self.ctx
                .drift
                .detect(first.keys().map(String::as_str), self.adapter.expected_keys(), self.name());
        }

        let armed = self.ctx.faults.is_enabled();
        let candidates = output.len();
        let mut accepted = Accepted {
            records: Vec::new(),
            high_water_mark: None,
        };

        for raw in &output.records {
            let record = match self.adapter.normalize(raw, output.fetched_at) {
                Ok(record) => record,
                Err(e) if e.is_validation() => {
                    tracing::warn!(source = %self.name(), error = %e, "validation_error");
                    record_validation_failure(self.name());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if checkpoint.as_ref().is_some_and(|cp| cp.covers(record.timestamp)) {
                continue;
            }

            accepted.high_water_mark = Some(match accepted.high_water_mark {
                Some(mark) => mark.max(record.timestamp),
                None => record.timestamp,
            });
            accepted.records.push(record);

            if FaultInjection::should_abort(armed, accepted.records.len(), candidates) {
                return Err(Error::ChaosTriggered);
            }
        }

        self.transition(RunState::Merging);
        let mut batch = MergeBatch::new(self.name());
        for record in accepted.records {
            batch.merge(self.ctx.store.as_ref(), record).await?;
        }

        self.transition(RunState::Committing);
        let records_processed = batch.records_merged();
        let update = CheckpointUpdate::success(
            self.name(),
            records_processed,
            self.started.elapsed(),
            accepted.high_water_mark,
        );
        // The store owns the commit deadline: a timeout from it means nothing landed.
        let report = self.ctx.store.commit(batch, update, self.ctx.commit_timeout).await?;

        if report.conflicts_resolved > 0 {
            tracing::info!(
                source = %self.name(),
                conflicts = report.conflicts_resolved,
                "Re-merged entities written concurrently by other sources"
            );
        }
        Ok(records_processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, RunStatus};
    use crate::ingestion::adapters::StaticAdapter;
    use crate::store::{MemoryStore, MockStore, Store};

    fn adapter(name: &str) -> Arc<StaticAdapter> {
        Arc::new(StaticAdapter::from_quotes(
            name,
            [
                ("BTC", 100.0, "2025-01-01T00:00:00Z"),
                ("ETH", 10.0, "2025-01-01T00:01:00Z"),
            ],
        ))
    }

    #[tokio::test]
    async fn commit_failure_records_failure_checkpoint() {
        let mut store = MockStore::new();
        store.expect_checkpoint().returning(|_| Ok(None));
        store.expect_entity().returning(|_| Ok(None));
        store
            .expect_commit()
            .times(1)
            .returning(|_, _, _| Err(Error::Storage("disk I/O error".into())));
        store
            .expect_upsert_checkpoint()
            .withf(|update| {
                update.status == RunStatus::Failure
                    && update.records_processed == 0
                    && update.high_water_mark.is_none()
                    && update.error.as_deref().is_some_and(|e| e.contains("disk I/O error"))
            })
            .times(1)
            .returning(|update| Ok(Checkpoint::apply(None, &update)));

        let ctx = PipelineContext::new(Arc::new(store));
        let outcome = SourceRun::new(ctx, adapter("mocked")).execute().await;

        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.records_processed, 0);
        assert!(outcome.error.unwrap().contains("disk I/O error"));
    }

    #[tokio::test]
    async fn commit_gets_the_configured_deadline() {
        let deadline = std::time::Duration::from_millis(750);
        let mut store = MockStore::new();
        store.expect_checkpoint().returning(|_| Ok(None));
        store.expect_entity().returning(|_| Ok(None));
        store
            .expect_commit()
            .withf(move |_, _, timeout| *timeout == deadline)
            .times(1)
            .returning(|_, _, timeout| Err(Error::Timeout(timeout)));
        store
            .expect_upsert_checkpoint()
            .withf(|update| update.status == RunStatus::Failure && update.high_water_mark.is_none())
            .times(1)
            .returning(|update| Ok(Checkpoint::apply(None, &update)));

        let ctx = PipelineContext::new(Arc::new(store))
            .with_timeouts(crate::pipeline::DEFAULT_FETCH_TIMEOUT, deadline);
        let outcome = SourceRun::new(ctx, adapter("slow_commit")).execute().await;

        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn successful_run_advances_the_mark() {
        let store = Arc::new(MemoryStore::new());
        let ctx = PipelineContext::new(store.clone());

        let outcome = SourceRun::new(ctx, adapter("static")).execute().await;
        assert_eq!(outcome.state, RunState::Succeeded);
        assert_eq!(outcome.records_processed, 2);

        let cp = store.checkpoint("static").await.unwrap().unwrap();
        assert_eq!(cp.last_status, RunStatus::Success);
        assert_eq!(cp.records_processed, 2);
        assert_eq!(cp.high_water_mark.unwrap().to_rfc3339(), "2025-01-01T00:01:00+00:00");
    }

    #[tokio::test]
    async fn fetch_failure_leaves_store_untouched_except_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let source = adapter("flaky");
        source.fail_with(Some("connection refused".into()));

        let outcome = SourceRun::new(PipelineContext::new(store.clone()), source).execute().await;
        assert_eq!(outcome.state, RunState::Failed);

        let err = outcome.error.unwrap();
        assert!(err.contains("connection refused"), "{}", err);
        assert!(store.entities(&Default::default()).await.unwrap().is_empty());

        let cp = store.checkpoint("flaky").await.unwrap().unwrap();
        assert_eq!(cp.last_status, RunStatus::Failure);
        assert_eq!(cp.high_water_mark, None);
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let store = Arc::new(MemoryStore::new());
        let slow = Arc::new(
            StaticAdapter::from_quotes("slow", [("BTC", 1.0, "2025-01-01T00:00:00Z")])
                .with_delay(std::time::Duration::from_secs(30)),
        );
        let ctx = PipelineContext::new(store.clone()).with_timeouts(
            std::time::Duration::from_millis(20),
            crate::pipeline::DEFAULT_COMMIT_TIMEOUT,
        );

        let outcome = SourceRun::new(ctx, slow).execute().await;
        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().contains("Timed out"));
    }
}
