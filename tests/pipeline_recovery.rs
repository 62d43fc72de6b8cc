//! Run-level recovery behavior: chaos aborts, idempotent reruns, the
//! inclusive high-water-mark boundary, and per-record validation failures.

mod common;

use common::{harness, quotes, T0};
use market_merge::checkpoint::RunStatus;
use market_merge::ingestion::adapters::static_source::quote;
use market_merge::ingestion::adapters::StaticAdapter;
use market_merge::pipeline::RunState;
use market_merge::store::EntityQuery;
use market_merge::types::{EntityKey, Ticker};
use serde_json::Value;
use std::sync::Arc;

fn five_records() -> Arc<StaticAdapter> {
    quotes(
        "chaos_source",
        &[
            ("CHAOS-0", 100.0, T0),
            ("CHAOS-1", 100.0, T0),
            ("CHAOS-2", 100.0, T0),
            ("CHAOS-3", 100.0, T0),
            ("CHAOS-4", 100.0, T0),
        ],
    )
}

#[tokio::test]
async fn chaos_abort_commits_nothing_and_recovers_on_rerun() {
    let h = harness(vec![five_records()]);
    h.faults.enable();

    let outcome = h.orchestrator.run_source("chaos_source").await.unwrap();
    assert_eq!(outcome.state, RunState::Failed);

    let cp = h.store.checkpoint("chaos_source").await.unwrap().unwrap();
    assert_eq!(cp.last_status, RunStatus::Failure);
    assert_eq!(cp.records_processed, 0);
    assert!(cp.last_error.as_deref().unwrap().contains("CHAOS_MODE_TRIGGERED"));
    assert_eq!(cp.high_water_mark, None);
    assert!(h.store.entities(&EntityQuery::default()).await.unwrap().is_empty());

    h.faults.disable();
    let outcome = h.orchestrator.run_source("chaos_source").await.unwrap();
    assert_eq!(outcome.state, RunState::Succeeded);

    let cp = h.store.checkpoint("chaos_source").await.unwrap().unwrap();
    assert_eq!(cp.last_status, RunStatus::Success);
    assert_eq!(cp.records_processed, 5);
    assert_eq!(cp.last_error, None);
    assert_eq!(h.store.entities(&EntityQuery::default()).await.unwrap().len(), 5);
}

#[tokio::test]
async fn chaos_failure_keeps_previous_mark() {
    let source = quotes("steady", &[("BTC", 100.0, "2025-01-01T00:00:00Z")]);
    let h = harness(vec![source.clone()]);
    h.orchestrator.run_source("steady").await.unwrap();
    let mark = h.store.checkpoint("steady").await.unwrap().unwrap().high_water_mark;
    assert!(mark.is_some());

    source.set_records(vec![
        quote("BTC", 101.0, "2025-01-02T00:00:00Z"),
        quote("ETH", 10.0, "2025-01-02T00:00:00Z"),
    ]);
    h.faults.enable();
    h.orchestrator.run_source("steady").await.unwrap();

    let cp = h.store.checkpoint("steady").await.unwrap().unwrap();
    assert_eq!(cp.last_status, RunStatus::Failure);
    assert_eq!(cp.high_water_mark, mark);
}

#[tokio::test]
async fn rerun_without_new_data_is_a_successful_no_op() {
    let h = harness(vec![quotes(
        "repeat",
        &[("BTC", 100.0, "2025-01-01T00:00:00Z"), ("ETH", 10.0, "2025-01-01T00:05:00Z")],
    )]);

    let first = h.orchestrator.run_source("repeat").await.unwrap();
    assert_eq!(first.records_processed, 2);

    let second = h.orchestrator.run_source("repeat").await.unwrap();
    assert_eq!(second.state, RunState::Succeeded);
    assert_eq!(second.records_processed, 0);

    let cp = h.store.checkpoint("repeat").await.unwrap().unwrap();
    assert_eq!(cp.last_status, RunStatus::Success);
    assert_eq!(cp.records_processed, 0);
    assert_eq!(cp.high_water_mark.unwrap().to_rfc3339(), "2025-01-01T00:05:00+00:00");
}

#[tokio::test]
async fn records_at_the_mark_are_excluded() {
    let source = quotes("boundary", &[("BTC", 100.0, T0)]);
    let h = harness(vec![source.clone()]);
    h.orchestrator.run_source("boundary").await.unwrap();

    source.set_records(vec![
        quote("BTC", 999.0, T0),
        quote("BTC", 50.0, "2025-01-01T11:59:59Z"),
        quote("BTC", 101.0, "2025-01-01T12:00:01Z"),
    ]);
    let outcome = h.orchestrator.run_source("boundary").await.unwrap();
    assert_eq!(outcome.records_processed, 1);

    let at_mark = EntityKey {
        ticker: Ticker::parse("BTC").unwrap(),
        timestamp: market_merge::types::timestamp::parse_timestamp(T0).unwrap(),
    };
    let row = h.store.entity(&at_mark).await.unwrap().unwrap();
    assert_eq!(row.entity.value, 100.0);
    assert_eq!(row.version, 1);

    let cp = h.store.checkpoint("boundary").await.unwrap().unwrap();
    assert_eq!(cp.high_water_mark.unwrap().to_rfc3339(), "2025-01-01T12:00:01+00:00");
}

#[tokio::test]
async fn record_missing_price_is_skipped() {
    let mut no_price = quote("ETH", 0.0, T0);
    no_price.remove("price");
    let mut malformed = quote("SOL", 0.0, T0);
    malformed.insert("price".to_string(), Value::from("n/a"));

    let source = Arc::new(StaticAdapter::new(
        "partial",
        vec![quote("BTC", 100.0, T0), no_price, malformed],
    ));
    let h = harness(vec![source]);

    let outcome = h.orchestrator.run_source("partial").await.unwrap();
    assert_eq!(outcome.state, RunState::Succeeded);
    assert_eq!(outcome.records_processed, 1);

    let all = h.store.entities(&EntityQuery::default()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].ticker.as_str(), "BTC");
}

#[tokio::test]
async fn one_source_failing_leaves_the_other_alone() {
    let broken = quotes("broken", &[("BTC", 1.0, T0)]);
    broken.fail_with(Some("503 from upstream".into()));
    let h = harness(vec![broken, quotes("healthy", &[("BTC", 2.0, T0)])]);

    let report = h.orchestrator.run_all().await;
    assert_eq!(report.outcome("broken").unwrap().state, RunState::Failed);
    assert!(report.outcome("healthy").unwrap().succeeded());

    let healthy = h.store.checkpoint("healthy").await.unwrap().unwrap();
    assert_eq!(healthy.last_status, RunStatus::Success);
    assert_eq!(healthy.records_processed, 1);
}
