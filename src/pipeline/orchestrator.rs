use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use crate::checkpoint::CheckpointUpdate;
use crate::error::{Error, Result};
use crate::ingestion::{SourceAdapter, SourceRegistry};
use crate::observability::metrics::record_run_end;
use crate::observability::tracing::{trace_pipeline_pass, trace_source_run};
use crate::pipeline::{PipelineContext, PipelineReport, RunOutcome, RunState, SourceRun};
use crate::utils::task_supervisor::{join_error_reason, TaskSupervisor};

/// Runs every registered source concurrently, one task per source, and
/// refuses to start a source that already has a run in flight.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: PipelineContext,
    registry: Arc<SourceRegistry>,
    in_flight: Arc<DashMap<String, Instant>>,
}

/// Holds a source's in-flight slot; released on drop, including on panic.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, Instant>>,
    source: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.source);
    }
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext, registry: SourceRegistry) -> Self {
        Orchestrator {
            ctx,
            registry: Arc::new(registry),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Sources with a run currently in flight.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.iter().map(|entry| entry.key().clone()).collect()
    }

    fn claim(&self, source: &str) -> Option<InFlightGuard> {
        match self.in_flight.entry(source.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    source: source.to_string(),
                })
            }
        }
    }

    pub async fn run_source(&self, source: &str) -> Result<RunOutcome> {
        let adapter = self
            .registry
            .get(source)
            .ok_or_else(|| Error::UnknownSource(source.to_string()))?;
        Ok(self.run_adapter(adapter).await)
    }

    async fn run_adapter(&self, adapter: Arc<dyn SourceAdapter>) -> RunOutcome {
        let source = adapter.name().to_string();
        let Some(_guard) = self.claim(&source) else {
            tracing::warn!(source = %source, "Run already in flight, skipping");
            return RunOutcome {
                source,
                state: RunState::Skipped,
                records_processed: 0,
                duration_ms: 0,
                error: None,
            };
        };

        SourceRun::new(self.ctx.clone(), adapter)
            .execute()
            .instrument(trace_source_run(&source))
            .await
    }

    /// One pass over every source. Waits for all of them; a source that
    /// fails or panics has no effect on the others.
    pub async fn run_all(&self) -> PipelineReport {
        let span = trace_pipeline_pass(self.registry.len());
        async {
            tracing::info!(sources = self.registry.len(), "pipeline_start");
            let started = Instant::now();

            let mut supervisor = TaskSupervisor::new();
            for adapter in self.registry.adapters() {
                let orchestrator = self.clone();
                let adapter = Arc::clone(adapter);
                supervisor.spawn(adapter.name().to_string(), async move {
                    orchestrator.run_adapter(adapter).await
                });
            }

            let mut report = PipelineReport::default();
            for (source, result) in supervisor.join_all().await {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(e) => self.record_crash(source, join_error_reason(e), started.elapsed()).await,
                };
                report.outcomes.push(outcome);
            }

            tracing::info!(
                succeeded = report.count(RunState::Succeeded),
                failed = report.count(RunState::Failed),
                skipped = report.count(RunState::Skipped),
                records = report.records_processed(),
                "pipeline_finish"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// A task that died before producing an outcome still leaves a failure checkpoint.
    async fn record_crash(&self, source: String, reason: String, elapsed: Duration) -> RunOutcome {
        tracing::error!(source = %source, error = %reason, "etl_failure");
        let update = CheckpointUpdate::failure(source.as_str(), elapsed, reason.as_str());
        if let Err(e) = self.ctx.store.upsert_checkpoint(update).await {
            tracing::error!(source = %source, error = %e, "Failure checkpoint not recorded");
        }
        record_run_end(&source, false, 0, elapsed);

        RunOutcome {
            source,
            state: RunState::Failed,
            records_processed: 0,
            duration_ms: elapsed.as_millis() as u64,
            error: Some(reason),
        }
    }

    /// Starts a pass in the background and returns at once.
    pub fn trigger(&self) -> JoinHandle<PipelineReport> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run_all().await })
    }

    /// Runs a pass every `every`, starting after the first interval. A pass
    /// that overruns delays the next tick instead of stacking passes.
    pub fn schedule(&self, every: Duration) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                orchestrator.run_all().await;
            }
        })
    }
}
