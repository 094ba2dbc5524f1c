//! Comparison engine
//!
//! Drives one event through `Received -> Collecting -> Matching -> Persisted`.
//! `Failed` is reached only when storage stays unavailable through the retry policy.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregator::Aggregator;
use super::collector::{ShadowCollector, ShadowSlot};
use super::matcher::ResponseMatcher;
use super::metrics::ComparisonMetrics;
use super::target::ShadowTarget;
use crate::config::{RetryPolicy, ServiceConfig};
use crate::error::{ProcessError, StoreError, ValidationError};
use crate::ingest::event::{ComparisonRequest, InboundEvent};
use crate::models::{ComparisonRecord, ShadowResult};
use crate::storage::{ComparisonStore, InsertOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonStage {
    Received,
    Collecting,
    Matching,
    Persisted,
    Failed,
}

impl fmt::Display for ComparisonStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonStage::Received => "received",
            ComparisonStage::Collecting => "collecting",
            ComparisonStage::Matching => "matching",
            ComparisonStage::Persisted => "persisted",
            ComparisonStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Terminal outcome that allows the delivery to be acknowledged
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Persisted { record_id: String, duplicate: bool },
    Rejected(ValidationError),
}

pub struct ComparisonEngine {
    /// Configured shadows in configuration order
    targets: Vec<Arc<dyn ShadowTarget>>,
    collector: ShadowCollector,
    matcher: ResponseMatcher,
    store: Arc<dyn ComparisonStore>,
    aggregator: Arc<Aggregator>,
    retry: RetryPolicy,
    default_primary_service: String,
    metrics: Arc<ComparisonMetrics>,
}

impl ComparisonEngine {
    pub fn new(
        config: &ServiceConfig,
        targets: Vec<Arc<dyn ShadowTarget>>,
        store: Arc<dyn ComparisonStore>,
        metrics: Arc<ComparisonMetrics>,
    ) -> Self {
        let aggregator = Arc::new(Aggregator::new(store.clone(), metrics.clone()));
        Self {
            targets,
            collector: ShadowCollector::new(config.collector.budget),
            matcher: ResponseMatcher::new(&config.matching),
            store,
            aggregator,
            retry: config.persistence.clone(),
            default_primary_service: config.default_primary_service.clone(),
            metrics,
        }
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.aggregator.clone()
    }

    pub fn metrics(&self) -> Arc<ComparisonMetrics> {
        self.metrics.clone()
    }

    /// Decode, validate and process one raw event
    pub async fn process_payload(&self, payload: &[u8]) -> Result<ProcessOutcome, ProcessError> {
        ComparisonMetrics::incr(&self.metrics.events_received);
        match InboundEvent::from_slice(payload) {
            Ok(event) => self.process_decoded(event).await,
            Err(e) => Ok(self.reject(e, None)),
        }
    }

    pub async fn process_event(&self, event: InboundEvent) -> Result<ProcessOutcome, ProcessError> {
        ComparisonMetrics::incr(&self.metrics.events_received);
        self.process_decoded(event).await
    }

    async fn process_decoded(&self, event: InboundEvent) -> Result<ProcessOutcome, ProcessError> {
        let request_id = event.request_id.clone();
        match event.validate(&self.default_primary_service, Utc::now()) {
            Ok(request) => self.process(request).await,
            Err(e) => Ok(self.reject(e, request_id)),
        }
    }

    fn reject(&self, error: ValidationError, request_id: Option<String>) -> ProcessOutcome {
        ComparisonMetrics::incr(&self.metrics.events_rejected);
        warn!(
            request_id = request_id.as_deref().unwrap_or("-"),
            stage = %ComparisonStage::Received,
            "event rejected: {}",
            error
        );
        ProcessOutcome::Rejected(error)
    }

    /// Run a validated request to a terminal stage
    pub async fn process(&self, request: ComparisonRequest) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();
        let request_id = request.request_id.clone();
        let created_at = request.created_at;
        let timestamped = request.timestamped;

        debug!(request_id = %request_id, stage = %ComparisonStage::Received, "comparison received");
        let existing = self
            .find_existing(&request_id, created_at, timestamped)
            .await?;
        if let Some(record) = existing {
            ComparisonMetrics::incr(&self.metrics.duplicates);
            info!(request_id = %request_id, record_id = %record.id, "duplicate event, record already persisted");
            self.aggregate(&record).await;
            return Ok(ProcessOutcome::Persisted {
                record_id: record.id,
                duplicate: true,
            });
        }

        debug!(request_id = %request_id, stage = %ComparisonStage::Collecting, "collecting shadows");
        let slots = self.plan(&request.shadow_targets);
        let results = self
            .collector
            .collect(Arc::new(request.request.clone()), &slots)
            .await;
        for result in &results {
            if let Some(failure) = result.failure() {
                self.metrics
                    .record_shadow_failure(&result.service_name, failure.kind);
            }
        }

        debug!(request_id = %request_id, stage = %ComparisonStage::Matching, "matching responses");
        let record = self.build_record(request, results);

        let outcome = self
            .with_retry(&request_id, || self.store.insert_record(&record))
            .await?;
        let (record, duplicate) = match outcome {
            InsertOutcome::Inserted => (record, false),
            InsertOutcome::AlreadyExists => {
                // Lost a race with a concurrent delivery of the same event
                ComparisonMetrics::incr(&self.metrics.duplicates);
                let stored = self
                    .find_existing(&request_id, created_at, timestamped)
                    .await?;
                (stored.unwrap_or(record), true)
            }
        };

        if !duplicate {
            ComparisonMetrics::incr(&self.metrics.records_persisted);
            if !record.status_match {
                ComparisonMetrics::incr(&self.metrics.status_mismatches);
            }
            if !record.body_match {
                ComparisonMetrics::incr(&self.metrics.body_mismatches);
            }
        }
        self.metrics
            .comparison_latency
            .record(started.elapsed().as_millis() as u64);

        info!(
            request_id = %request_id,
            record_id = %record.id,
            stage = %ComparisonStage::Persisted,
            status_match = record.status_match,
            body_match = record.body_match,
            duplicate,
            "comparison persisted"
        );

        self.aggregate(&record).await;

        Ok(ProcessOutcome::Persisted {
            record_id: record.id,
            duplicate,
        })
    }

    /// Event names in event order, else all configured shadows
    fn plan(&self, requested: &[String]) -> Vec<ShadowSlot> {
        if requested.is_empty() {
            return self.targets.iter().cloned().map(ShadowSlot::Target).collect();
        }

        let mut seen = HashSet::new();
        requested
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .map(|name| {
                self.targets
                    .iter()
                    .find(|t| t.name() == name.as_str())
                    .cloned()
                    .map(ShadowSlot::Target)
                    .unwrap_or_else(|| ShadowSlot::Unknown(name.clone()))
            })
            .collect()
    }

    fn build_record(&self, request: ComparisonRequest, results: Vec<ShadowResult>) -> ComparisonRecord {
        let mut status_match = true;
        let mut body_match = true;
        let mut header_differences = BTreeMap::new();
        let mut discrepancies = BTreeMap::new();
        let mut response_time_diff_ms = BTreeMap::new();
        let primary_time = request.primary.response_time_ms as i64;

        for result in &results {
            let outcome = self.matcher.compare(&request.primary, result);
            status_match &= outcome.status_match;
            body_match &= outcome.body_match;
            header_differences.insert(result.service_name.clone(), outcome.header_differences);
            discrepancies.insert(result.service_name.clone(), outcome.discrepancies);
            if let Some(response) = result.response() {
                response_time_diff_ms.insert(
                    result.service_name.clone(),
                    response.response_time_ms as i64 - primary_time,
                );
            }
        }

        ComparisonRecord {
            id: Uuid::new_v4().to_string(),
            request_id: request.request_id,
            created_at: request.created_at,
            timestamped: request.timestamped,
            request: request.request,
            primary_response: request.primary,
            shadow_responses: results,
            status_match,
            body_match,
            header_differences,
            response_time_diff_ms,
            discrepancies,
            metadata: request.metadata,
        }
    }

    /// A timestamped event is identified by `(request_id, created_at)`; otherwise
    /// every delivery has its own receipt time and only the request id is stable.
    async fn find_existing(
        &self,
        request_id: &str,
        created_at: DateTime<Utc>,
        timestamped: bool,
    ) -> Result<Option<ComparisonRecord>, ProcessError> {
        if timestamped {
            self.with_retry(request_id, || self.store.find_record(request_id, created_at))
                .await
        } else {
            self.with_retry(request_id, || self.store.find_untimestamped_record(request_id))
                .await
        }
    }

    /// Aggregation failures are left to reconciliation
    async fn aggregate(&self, record: &ComparisonRecord) {
        if let Err(e) = self.aggregator.apply(record).await {
            ComparisonMetrics::incr(&self.metrics.aggregation_failures);
            warn!(record_id = %record.id, "aggregate update deferred to reconciliation: {}", e);
        }
    }

    async fn with_retry<T, F, Fut>(&self, request_id: &str, mut op: F) -> Result<T, ProcessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    ComparisonMetrics::incr(&self.metrics.persistence_retries);
                    warn!(
                        request_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "storage unavailable, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    ComparisonMetrics::incr(&self.metrics.persistence_failures);
                    warn!(request_id, stage = %ComparisonStage::Failed, attempts = attempt, "comparison failed: {}", e);
                    return Err(ProcessError::Persistence {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparison::collector::tests::FakeTarget;
    use crate::config::ShadowTargetConfig;
    use crate::models::{AggregateDelta, AggregateStat, DiffReason, FailureKind};
    use crate::storage::{ApplyOutcome, SqliteStore};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(budget_ms: u64) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.collector.budget = Duration::from_millis(budget_ms);
        config.persistence.initial_backoff = Duration::from_millis(1);
        config.persistence.max_backoff = Duration::from_millis(5);
        config.persistence.max_attempts = 3;
        config.shadows.push(ShadowTargetConfig {
            name: "v2".into(),
            url: "http://unused".into(),
            enabled: true,
        });
        config
    }

    fn event(request_id: &str) -> serde_json::Value {
        json!({
            "requestId": request_id,
            "method": "GET",
            "path": "/items",
            "primaryServiceName": "v1",
            "primaryStatusCode": 200,
            "primaryResponseHeaders": {"content-type": "application/json"},
            "primaryResponseBody": "{\"a\":1}",
            "primaryResponseTimeMs": 40,
            "timestamp": "2025-06-01T10:00:00.000Z"
        })
    }

    fn payload(value: &serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    fn engine_with(
        targets: Vec<Arc<dyn ShadowTarget>>,
        budget_ms: u64,
    ) -> (Arc<SqliteStore>, ComparisonEngine) {
        let store = Arc::new(SqliteStore::open(":memory:").unwrap());
        let engine = ComparisonEngine::new(
            &config(budget_ms),
            targets,
            store.clone(),
            Arc::new(ComparisonMetrics::new()),
        );
        (store, engine)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    async fn persisted(store: &SqliteStore, outcome: ProcessOutcome) -> ComparisonRecord {
        match outcome {
            ProcessOutcome::Persisted { record_id, .. } => {
                store.get_record(&record_id).await.unwrap().unwrap()
            }
            other => panic!("expected persisted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identical_responses_match() {
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO)],
            1000,
        );
        let outcome = engine.process_payload(&payload(&event("req-1"))).await.unwrap();
        let record = persisted(&store, outcome).await;

        assert!(record.status_match);
        assert!(record.body_match);
        assert!(record.header_differences["v2"].is_empty());
        assert!(record.discrepancies["v2"].is_empty());
        assert_eq!(record.response_time_diff_ms["v2"], -40);
    }

    #[tokio::test]
    async fn test_status_mismatch_keeps_body_match() {
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 500, r#"{"a":1}"#, Duration::ZERO)],
            1000,
        );
        let outcome = engine.process_payload(&payload(&event("req-1"))).await.unwrap();
        let record = persisted(&store, outcome).await;

        assert!(!record.status_match);
        assert!(record.body_match);
        assert_eq!(
            engine.metrics().status_mismatches.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_any_failed_shadow_breaks_match() {
        let (store, engine) = engine_with(
            vec![
                FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO),
                FakeTarget::ok("v3", 200, r#"{"a":1}"#, Duration::from_secs(10)),
            ],
            150,
        );
        let outcome = engine.process_payload(&payload(&event("req-1"))).await.unwrap();
        let record = persisted(&store, outcome).await;

        assert!(!record.status_match);
        assert!(!record.body_match);
        assert_eq!(record.shadow_responses.len(), 2);
        assert_eq!(
            record.shadow_responses[1].failure().unwrap().kind,
            FailureKind::Timeout
        );
        assert_eq!(record.discrepancies["v3"][0].reason, DiffReason::Timeout);
        assert!(!record.response_time_diff_ms.contains_key("v3"));
    }

    #[tokio::test]
    async fn test_event_selects_shadows_in_event_order() {
        let (store, engine) = engine_with(
            vec![
                FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO),
                FakeTarget::ok("v3", 200, r#"{"a":1}"#, Duration::ZERO),
            ],
            1000,
        );
        let mut e = event("req-1");
        e["shadowTargets"] = json!(["v3", "ghost", "v3"]);
        let outcome = engine.process_payload(&payload(&e)).await.unwrap();
        let record = persisted(&store, outcome).await;

        let names: Vec<&str> = record
            .shadow_responses
            .iter()
            .map(|s| s.service_name.as_str())
            .collect();
        assert_eq!(names, vec!["v3", "ghost"]);
        assert_eq!(
            record.shadow_responses[1].failure().unwrap().kind,
            FailureKind::ConnectionError
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO)],
            1000,
        );
        let body = payload(&event("req-1"));

        let first = engine.process_payload(&body).await.unwrap();
        let second = engine.process_payload(&body).await.unwrap();

        let (ProcessOutcome::Persisted { record_id: a, duplicate: false }, ProcessOutcome::Persisted { record_id: b, duplicate: true }) = (first, second) else {
            panic!("unexpected outcomes");
        };
        assert_eq!(a, b);
        assert_eq!(store.record_count().unwrap(), 1);

        let stat = store.get_aggregate(day(), "v1").await.unwrap().unwrap();
        assert_eq!(stat.total_requests, 1);
    }

    #[tokio::test]
    async fn test_redelivered_event_without_timestamp_is_idempotent() {
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO)],
            1000,
        );
        let mut e = event("req-untimed");
        e.as_object_mut().unwrap().remove("timestamp");
        let body = payload(&e);

        let first = engine.process_payload(&body).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine.process_payload(&body).await.unwrap();

        let (ProcessOutcome::Persisted { record_id: a, duplicate: false }, ProcessOutcome::Persisted { record_id: b, duplicate: true }) = (first, second) else {
            panic!("unexpected outcomes");
        };
        assert_eq!(a, b);
        assert_eq!(store.record_count().unwrap(), 1);

        let record = store.get_record(&a).await.unwrap().unwrap();
        assert!(!record.timestamped);
        let stat = store
            .get_aggregate(record.date(), "v1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stat.total_requests, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_converge_to_one_record() {
        // Shadow latency keeps every delivery past the duplicate lookup before any insert
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::from_millis(50))],
            1000,
        );
        let engine = Arc::new(engine);

        for e in [event("req-race"), {
            let mut untimed = event("req-race-untimed");
            untimed.as_object_mut().unwrap().remove("timestamp");
            untimed
        }] {
            let body = payload(&e);
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let engine = engine.clone();
                    let body = body.clone();
                    tokio::spawn(async move { engine.process_payload(&body).await.unwrap() })
                })
                .collect();

            let mut ids = HashSet::new();
            let mut fresh = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    ProcessOutcome::Persisted { record_id, duplicate } => {
                        ids.insert(record_id);
                        if !duplicate {
                            fresh += 1;
                        }
                    }
                    other => panic!("expected persisted, got {other:?}"),
                }
            }
            assert_eq!(ids.len(), 1);
            assert_eq!(fresh, 1);
        }

        assert_eq!(store.record_count().unwrap(), 2);
        assert_eq!(engine.metrics().duplicates.load(Ordering::Relaxed), 6);

        let timed = store
            .find_record("req-race", "2025-06-01T10:00:00Z".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        let untimed = store
            .find_untimestamped_record("req-race-untimed")
            .await
            .unwrap()
            .unwrap();
        // The untimestamped record is dated by receipt, so it lands on its own row
        assert_ne!(timed.date(), untimed.date());
        for record in [timed, untimed] {
            let stat = store
                .get_aggregate(record.date(), "v1")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stat.total_requests, 1);
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_events() {
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 200, "{}", Duration::ZERO)],
            1000,
        );
        let mut e = event("req-1");
        e.as_object_mut().unwrap().remove("primaryStatusCode");

        let outcome = engine.process_payload(&payload(&e)).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Rejected(ValidationError::MissingField("primaryStatusCode"))
        );
        assert!(matches!(
            engine.process_payload(b"{oops").await.unwrap(),
            ProcessOutcome::Rejected(ValidationError::Malformed(_))
        ));
        assert_eq!(store.record_count().unwrap(), 0);
        assert_eq!(engine.metrics().events_rejected.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_aggregates_over_many_events() {
        let (store, engine) = engine_with(
            vec![FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO)],
            1000,
        );
        for i in 0..4 {
            let mut e = event(&format!("req-{i}"));
            if i == 3 {
                e["primaryStatusCode"] = json!(404);
            }
            engine.process_payload(&payload(&e)).await.unwrap();
        }

        let stat = store.get_aggregate(day(), "v1").await.unwrap().unwrap();
        assert_eq!(stat.total_requests, 4);
        assert_eq!(stat.status_matches, 3);
        assert_eq!(stat.body_matches, 4);
        assert!((stat.avg_response_time_diff_ms - -40.0).abs() < 1e-9);
    }

    /// Store that is unavailable for the first `failures` writes
    struct FlakyStore {
        inner: SqliteStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ComparisonStore for FlakyStore {
        async fn insert_record(&self, record: &ComparisonRecord) -> Result<InsertOutcome, StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            self.inner.insert_record(record).await
        }

        async fn upsert_aggregate(
            &self,
            date: NaiveDate,
            primary_service: &str,
            delta: &AggregateDelta,
        ) -> Result<ApplyOutcome, StoreError> {
            self.inner.upsert_aggregate(date, primary_service, delta).await
        }

        async fn get_record(&self, id: &str) -> Result<Option<ComparisonRecord>, StoreError> {
            self.inner.get_record(id).await
        }

        async fn find_record(
            &self,
            request_id: &str,
            created_at: DateTime<Utc>,
        ) -> Result<Option<ComparisonRecord>, StoreError> {
            self.inner.find_record(request_id, created_at).await
        }

        async fn find_untimestamped_record(
            &self,
            request_id: &str,
        ) -> Result<Option<ComparisonRecord>, StoreError> {
            self.inner.find_untimestamped_record(request_id).await
        }

        async fn recent_records(
            &self,
            primary_service: Option<&str>,
            before: Option<DateTime<Utc>>,
            limit: usize,
        ) -> Result<Vec<ComparisonRecord>, StoreError> {
            self.inner.recent_records(primary_service, before, limit).await
        }

        async fn get_aggregate(
            &self,
            date: NaiveDate,
            primary_service: &str,
        ) -> Result<Option<AggregateStat>, StoreError> {
            self.inner.get_aggregate(date, primary_service).await
        }

        async fn list_aggregates(&self, date: NaiveDate) -> Result<Vec<AggregateStat>, StoreError> {
            self.inner.list_aggregates(date).await
        }

        async fn unaggregated_records(&self, limit: usize) -> Result<Vec<ComparisonRecord>, StoreError> {
            self.inner.unaggregated_records(limit).await
        }
    }

    fn flaky_engine(failures: u32) -> (Arc<FlakyStore>, ComparisonEngine) {
        let store = Arc::new(FlakyStore {
            inner: SqliteStore::open(":memory:").unwrap(),
            failures: AtomicU32::new(failures),
        });
        let engine = ComparisonEngine::new(
            &config(1000),
            vec![FakeTarget::ok("v2", 200, r#"{"a":1}"#, Duration::ZERO)],
            store.clone(),
            Arc::new(ComparisonMetrics::new()),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let (store, engine) = flaky_engine(2);
        let outcome = engine.process_payload(&payload(&event("req-1"))).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Persisted { duplicate: false, .. }));
        assert_eq!(store.inner.record_count().unwrap(), 1);
        assert_eq!(engine.metrics().persistence_retries.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let (store, engine) = flaky_engine(10);
        let err = engine
            .process_payload(&payload(&event("req-1")))
            .await
            .unwrap_err();
        let ProcessError::Persistence { attempts, .. } = err;
        assert_eq!(attempts, 3);
        assert_eq!(store.inner.record_count().unwrap(), 0);
    }
}
