#![allow(dead_code)]

use std::sync::Arc;
use market_merge::controls::FaultInjection;
use market_merge::ingestion::adapters::StaticAdapter;
use market_merge::ingestion::{SourceAdapter, SourceRegistry};
use market_merge::pipeline::{Orchestrator, PipelineContext};
use market_merge::store::{MemoryStore, Store};

pub const T0: &str = "2025-01-01T12:00:00Z";

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub faults: FaultInjection,
    pub orchestrator: Orchestrator,
}

pub fn harness(sources: Vec<Arc<StaticAdapter>>) -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()), sources)
}

pub fn harness_with_store(store: Arc<dyn Store>, sources: Vec<Arc<StaticAdapter>>) -> Harness {
    let faults = FaultInjection::new(false);
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source as Arc<dyn SourceAdapter>).unwrap();
    }
    let ctx = PipelineContext::new(store.clone()).with_faults(faults.clone());
    Harness {
        store,
        faults,
        orchestrator: Orchestrator::new(ctx, registry),
    }
}

pub fn quotes(name: &str, quotes: &[(&str, f64, &str)]) -> Arc<StaticAdapter> {
    Arc::new(StaticAdapter::from_quotes(name, quotes.iter().copied()))
}
