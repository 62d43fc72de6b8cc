use axum::{
    Router,
    routing::{get, post},
    extract::{Query, State, Json},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;
use crate::checkpoint::{Checkpoint, RunStatus};
use crate::error::Error;
use crate::observability::metrics::metrics_text;
use crate::pipeline::Orchestrator;
use crate::store::{EntityQuery, Store, DEFAULT_PAGE_SIZE};
use crate::types::{Ticker, Timestamp};
use crate::unify::UnifiedEntity;

pub const MAX_PAGE_SIZE: usize = 1_000;

pub struct ApiState {
    pub orchestrator: Orchestrator,
}

impl ApiState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        ApiState { orchestrator }
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.orchestrator.context().store
    }
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/data", get(list_data))
        .route("/stats", get(etl_stats))
        .route("/runs", get(list_runs))
        .route("/etl/run", post(trigger_run))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Crate errors as JSON responses. Bad query input is a 400, the rest 500.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    db_connectivity: String,
    etl_status: &'static str,
    last_run: Option<Timestamp>,
    latency_ms: f64,
}

/// ETL status across all sources: any failing source makes the whole thing `failure`.
fn etl_status(checkpoints: &[Checkpoint]) -> &'static str {
    if checkpoints.is_empty() {
        "no_runs_yet"
    } else if checkpoints.iter().any(|cp| cp.last_status == RunStatus::Failure) {
        "failure"
    } else {
        "success"
    }
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let started = Instant::now();
    let mut etl = "unknown";
    let mut last_run = None;

    let db_connectivity = match state.store().ping().await {
        Ok(()) => match state.store().checkpoints().await {
            Ok(checkpoints) => {
                etl = etl_status(&checkpoints);
                last_run = checkpoints.iter().filter_map(|cp| cp.high_water_mark).max();
                "connected".to_string()
            }
            Err(e) => format!("error: {}", e),
        },
        Err(e) => format!("error: {}", e),
    };

    Json(HealthResponse {
        status: "ok",
        db_connectivity,
        etl_status: etl,
        last_run,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}

#[derive(Deserialize)]
struct DataParams {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
    ticker: Option<String>,
}

#[derive(Serialize)]
struct Meta {
    request_id: Uuid,
    latency_ms: f64,
}

#[derive(Serialize)]
struct Page<T> {
    meta: Meta,
    data: Vec<T>,
}

async fn list_data(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<DataParams>,
) -> Result<Json<Page<UnifiedEntity>>, ApiError> {
    let started = Instant::now();
    let query = EntityQuery {
        ticker: params.ticker.as_deref().map(Ticker::parse).transpose()?,
        offset: params.offset,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
    };

    let data = state.store().entities(&query).await?;
    Ok(Json(Page {
        meta: Meta {
            request_id: Uuid::new_v4(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        },
        data,
    }))
}

#[derive(Serialize)]
struct SourceStats {
    source_name: String,
    status: RunStatus,
    records_processed: u64,
    last_ingested_at: Option<Timestamp>,
    duration_ms: u64,
    error_log: Option<String>,
}

#[derive(Serialize)]
struct StatsResponse {
    etl_stats: Vec<SourceStats>,
}

async fn etl_stats(State(state): State<Arc<ApiState>>) -> Result<Json<StatsResponse>, ApiError> {
    let etl_stats = state
        .store()
        .checkpoints()
        .await?
        .into_iter()
        .map(|cp| SourceStats {
            source_name: cp.source_name,
            status: cp.last_status,
            records_processed: cp.records_processed,
            last_ingested_at: cp.high_water_mark,
            duration_ms: cp.run_duration_ms,
            error_log: cp.last_error,
        })
        .collect();
    Ok(Json(StatsResponse { etl_stats }))
}

#[derive(Deserialize)]
struct RunsParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<RunsParams>,
) -> Result<Json<Vec<Checkpoint>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let mut runs = state.store().checkpoints().await?;
    runs.truncate(limit);
    Ok(Json(runs))
}

/// Accepts the trigger and returns; per-source outcomes land in `/stats`.
async fn trigger_run(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let handle = state.orchestrator.trigger();
    tracing::info!(sources = state.orchestrator.registry().len(), "Pipeline pass triggered");
    drop(handle);
    Json(serde_json::json!({ "status": "triggered" }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use crate::ingestion::adapters::StaticAdapter;
    use crate::ingestion::SourceRegistry;
    use crate::pipeline::PipelineContext;
    use crate::store::MemoryStore;

    fn state(sources: Vec<StaticAdapter>) -> Arc<ApiState> {
        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.register(Arc::new(source)).unwrap();
        }
        let ctx = PipelineContext::new(Arc::new(MemoryStore::new()));
        Arc::new(ApiState::new(Orchestrator::new(ctx, registry)))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_before_any_run() {
        let (status, body) = get_json(create_router(state(Vec::new())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["db_connectivity"], "connected");
        assert_eq!(body["etl_status"], "no_runs_yet");
        assert!(body["last_run"].is_null());
    }

    #[tokio::test]
    async fn data_is_paginated_and_filtered_by_ticker() {
        let state = state(vec![StaticAdapter::from_quotes(
            "static",
            [
                ("BTC", 100.0, "2025-01-01T00:00:00Z"),
                ("BTC", 101.0, "2025-01-01T00:01:00Z"),
                ("ETH", 10.0, "2025-01-01T00:00:00Z"),
            ],
        )]);
        state.orchestrator.run_all().await;
        let router = create_router(state);

        let (_, body) = get_json(router.clone(), "/data?ticker=btc&limit=1&offset=1").await;
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["ticker"], "BTC");
        assert_eq!(data[0]["value"], 101.0);
        assert!(body["meta"]["request_id"].is_string());

        let (_, body) = get_json(router.clone(), "/data").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 3);

        let (_, body) = get_json(router, "/stats").await;
        assert_eq!(body["etl_stats"][0]["source_name"], "static");
        assert_eq!(body["etl_stats"][0]["status"], "success");
        assert_eq!(body["etl_stats"][0]["records_processed"], 3);
    }

    #[tokio::test]
    async fn blank_ticker_filter_is_a_bad_request() {
        let (status, body) = get_json(create_router(state(Vec::new())), "/data?ticker=%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("ticker"));
    }

    #[tokio::test]
    async fn trigger_returns_before_the_pass_finishes() {
        let slow = StaticAdapter::from_quotes("slow", [("BTC", 1.0, "2025-01-01T00:00:00Z")])
            .with_delay(std::time::Duration::from_millis(300));
        let state = state(vec![slow]);
        let router = create_router(state.clone());

        let response = router
            .oneshot(Request::builder().method("POST").uri("/etl/run").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["status"], "triggered");

        assert!(state.orchestrator.context().store.checkpoint("slow").await.unwrap().is_none());
    }

    #[test]
    fn any_failed_source_marks_etl_failure() {
        let ok = Checkpoint::apply(None, &crate::checkpoint::CheckpointUpdate::success(
            "a", 1, std::time::Duration::ZERO, None,
        ));
        let failed = Checkpoint::apply(None, &crate::checkpoint::CheckpointUpdate::failure(
            "b", std::time::Duration::ZERO, "boom",
        ));
        assert_eq!(etl_status(&[ok.clone()]), "success");
        assert_eq!(etl_status(&[ok, failed]), "failure");
    }
}
