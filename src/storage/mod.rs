//! Record sink and query source
//!
//! The engine and aggregator only see [`ComparisonStore`]. [`SqliteStore`] is the
//! embedded implementation used by the service binary and the tests.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::models::{AggregateDelta, AggregateStat, ComparisonRecord};

/// Result of inserting a comparison record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same `(request_id, created_at)` is already stored
    AlreadyExists,
}

/// Result of applying a record to its aggregate row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The record id was applied before; counters untouched
    AlreadyApplied,
}

/// Durable storage for comparison records and daily aggregates.
///
/// All methods are safe to call concurrently.
#[async_trait]
pub trait ComparisonStore: Send + Sync {
    async fn insert_record(&self, record: &ComparisonRecord) -> Result<InsertOutcome, StoreError>;

    /// Atomically fold one record into the `(date, service)` row, at most once per record id
    async fn upsert_aggregate(
        &self,
        date: NaiveDate,
        primary_service: &str,
        delta: &AggregateDelta,
    ) -> Result<ApplyOutcome, StoreError>;

    async fn get_record(&self, id: &str) -> Result<Option<ComparisonRecord>, StoreError>;

    async fn find_record(
        &self,
        request_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<ComparisonRecord>, StoreError>;

    /// The record of an event that carried no timestamp, keyed by request id alone
    async fn find_untimestamped_record(
        &self,
        request_id: &str,
    ) -> Result<Option<ComparisonRecord>, StoreError>;

    /// Newest first, optionally filtered by primary service and strictly older than `before`
    async fn recent_records(
        &self,
        primary_service: Option<&str>,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ComparisonRecord>, StoreError>;

    async fn get_aggregate(
        &self,
        date: NaiveDate,
        primary_service: &str,
    ) -> Result<Option<AggregateStat>, StoreError>;

    async fn list_aggregates(&self, date: NaiveDate) -> Result<Vec<AggregateStat>, StoreError>;

    /// Persisted records whose aggregate contribution has not been applied, oldest first
    async fn unaggregated_records(&self, limit: usize) -> Result<Vec<ComparisonRecord>, StoreError>;
}
