use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::comparison::ComparisonMetrics;
use crate::error::{EnqueueError, StoreError};
use crate::ingest::SqliteSpool;
use crate::middleware::request_logging_simple;
use crate::models::{AggregateStat, ComparisonRecord};
use crate::storage::ComparisonStore;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ComparisonStore>,
    pub spool: Arc<SqliteSpool>,
    pub metrics: Arc<ComparisonMetrics>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/events", post(ingest_event))
        .route("/log/request", post(ingest_event))
        .route("/comparisons", get(list_comparisons))
        .route("/comparisons/:id", get(get_comparison))
        .route("/stats", get(get_stats))
        .layer(middleware::from_fn(request_logging_simple))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> String {
    let mut output = state.metrics.to_prometheus();
    if let Ok(depth) = state.spool.depth() {
        output.push_str("\n# HELP doppelganger_spool_depth Events waiting in the ingest spool\n");
        output.push_str("# TYPE doppelganger_spool_depth gauge\n");
        output.push_str(&format!("doppelganger_spool_depth {}\n", depth));
    }
    output
}

/// Durably accept one mirrored-traffic event
async fn ingest_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    match state.spool.enqueue(&body) {
        Ok(seq) => Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { seq }))),
        Err(EnqueueError::Invalid(e)) => {
            ComparisonMetrics::incr(&state.metrics.events_rejected);
            Err(ApiError::BadRequest(e.to_string()))
        }
        Err(EnqueueError::Store(e)) => Err(ApiError::Store(e)),
    }
}

/// Recent comparison records, newest first
async fn list_comparisons(
    State(state): State<AppState>,
    Query(params): Query<ComparisonQuery>,
) -> Result<Json<ComparisonsResponse>, ApiError> {
    let before = params
        .before
        .as_deref()
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| ApiError::BadRequest(format!("invalid `before`: {e}")))
        })
        .transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let records = state
        .store
        .recent_records(params.service.as_deref(), before, limit)
        .await?;

    Ok(Json(ComparisonsResponse {
        count: records.len(),
        records,
    }))
}

async fn get_comparison(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ComparisonRecord>, ApiError> {
    state
        .store
        .get_record(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Comparison {} not found", id)))
}

/// Daily aggregates for one date (default: today, UTC)
async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let date = match params.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|e| ApiError::BadRequest(format!("invalid `date`: {e}")))?,
        None => Utc::now().date_naive(),
    };

    let stats = match params.service.as_deref() {
        Some(service) => state
            .store
            .get_aggregate(date, service)
            .await?
            .into_iter()
            .collect(),
        None => state.store.list_aggregates(date).await?,
    };

    Ok(Json(StatsResponse { date, stats }))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct ComparisonQuery {
    /// Primary service name
    service: Option<String>,
    /// RFC 3339; only records created strictly before
    before: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct StatsQuery {
    date: Option<String>,
    service: Option<String>,
}

#[derive(Serialize)]
struct EnqueueResponse {
    seq: u64,
}

#[derive(Serialize)]
struct ComparisonsResponse {
    count: usize,
    records: Vec<ComparisonRecord>,
}

#[derive(Serialize)]
struct StatsResponse {
    date: NaiveDate,
    stats: Vec<AggregateStat>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    NotFound(String),
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Store(err) => {
                tracing::error!("Storage error: {}", err);
                let status = if err.is_transient() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, "Storage error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::ingest::EventSource;
    use crate::models::{fixtures, AggregateDelta};
    use crate::storage::SqliteStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use tower::ServiceExt;

    fn state() -> (Arc<SqliteStore>, AppState) {
        let store = Arc::new(SqliteStore::open(":memory:").unwrap());
        let state = AppState {
            store: store.clone(),
            spool: Arc::new(SqliteSpool::open(":memory:", &IngestConfig::default()).unwrap()),
            metrics: Arc::new(ComparisonMetrics::new()),
        };
        (store, state)
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, state) = state();
        let response = create_router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_ingest_accepts_and_spools() {
        let (_, state) = state();
        let spool = state.spool.clone();

        let request = Request::builder()
            .method("POST")
            .uri("/log/request")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"request_id":"r1","method":"GET"}"#))
            .unwrap();
        let (status, body) = call(create_router(state.clone()), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["seq"].as_u64().is_some());

        let delivery = spool.next().await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(event["request_id"], "r1");
        assert!(event["receivedAt"].is_string());

        let bad = Request::builder()
            .method("POST")
            .uri("/events")
            .body(Body::from("not json"))
            .unwrap();
        let (status, _) = call(create_router(state.clone()), bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            state
                .metrics
                .events_rejected
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_comparison_queries() {
        let (store, state) = state();
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let record = fixtures::record("req-1", created);
        store.insert_record(&record).await.unwrap();
        store
            .upsert_aggregate(record.date(), "v1", &AggregateDelta::from_record(&record))
            .await
            .unwrap();

        let (status, body) = call(create_router(state.clone()), get("/comparisons?service=v1&limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["requestId"], "req-1");

        let (status, body) = call(
            create_router(state.clone()),
            get(&format!("/comparisons/{}", record.id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statusMatch"], true);

        let (status, _) = call(create_router(state.clone()), get("/comparisons/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(create_router(state.clone()), get("/comparisons?before=yesterday")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(create_router(state.clone()), get("/stats?date=2025-06-01")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"][0]["totalRequests"], 1);
        assert_eq!(body["stats"][0]["primaryServiceName"], "v1");

        let (_, body) = call(create_router(state), get("/stats?date=2025-06-01&service=other")).await;
        assert_eq!(body["stats"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_, state) = state();
        let response = create_router(state).oneshot(get("/metrics")).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("doppelganger_events_received_total 0"));
        assert!(text.contains("doppelganger_spool_depth 0"));
    }
}
