//! SQLite-backed comparison store
//!
//! - WAL mode so API reads proceed during worker writes
//! - `(request_id, created_at)` uniqueness enforces one record per comparison, and
//!   `request_id` alone for events that carried no timestamp
//! - aggregate counters and the applied-record marker move in one immediate transaction

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{ApplyOutcome, ComparisonStore, InsertOutcome};
use crate::error::StoreError;
use crate::models::{format_timestamp, AggregateDelta, AggregateStat, ComparisonRecord};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS comparison_records (
    id TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    date TEXT NOT NULL,
    primary_service TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    status_match INTEGER NOT NULL,
    body_match INTEGER NOT NULL,
    request_json TEXT NOT NULL,
    primary_response_json TEXT NOT NULL,
    shadow_responses_json TEXT NOT NULL,
    header_differences_json TEXT NOT NULL,
    response_time_diff_json TEXT NOT NULL,
    discrepancies_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    timestamped INTEGER NOT NULL DEFAULT 1,
    UNIQUE (request_id, created_at)
) WITHOUT ROWID;

-- Events without a producer timestamp are keyed by request id alone
CREATE UNIQUE INDEX IF NOT EXISTS idx_records_untimestamped
    ON comparison_records(request_id) WHERE timestamped = 0;

CREATE INDEX IF NOT EXISTS idx_records_created
    ON comparison_records(created_at DESC);

CREATE INDEX IF NOT EXISTS idx_records_service
    ON comparison_records(primary_service, created_at DESC);

CREATE TABLE IF NOT EXISTS aggregate_stats (
    date TEXT NOT NULL,
    primary_service TEXT NOT NULL,
    total_requests INTEGER NOT NULL,
    status_matches INTEGER NOT NULL,
    body_matches INTEGER NOT NULL,
    timed_requests INTEGER NOT NULL,
    avg_response_time_diff_ms REAL NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (date, primary_service)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS aggregate_applied (
    record_id TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL
) WITHOUT ROWID;
"#;

const RECORD_COLUMNS: &str = "id, request_id, created_at, status_match, body_match, \
     request_json, primary_response_json, shadow_responses_json, header_differences_json, \
     response_time_diff_json, discrepancies_json, metadata_json, timestamped";

const AGGREGATE_COLUMNS: &str = "date, primary_service, total_requests, status_matches, \
     body_matches, timed_requests, avg_response_time_diff_ms, updated_at";

/// Embedded [`ComparisonStore`]
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`. `:memory:` gives a private database.
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize comparison schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && !journal_mode.eq_ignore_ascii_case("wal") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM comparison_records", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, records = count, "comparison store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of stored records
    pub fn record_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM comparison_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ComparisonRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, Self::row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ComparisonRecord> {
        fn json<T: serde::de::DeserializeOwned>(
            row: &rusqlite::Row,
            idx: usize,
        ) -> rusqlite::Result<T> {
            let raw: String = row.get(idx)?;
            serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        }

        let created_at: String = row.get(2)?;
        Ok(ComparisonRecord {
            id: row.get(0)?,
            request_id: row.get(1)?,
            created_at: parse_timestamp(2, &created_at)?,
            status_match: row.get(3)?,
            body_match: row.get(4)?,
            request: json(row, 5)?,
            primary_response: json(row, 6)?,
            shadow_responses: json(row, 7)?,
            header_differences: json(row, 8)?,
            response_time_diff_ms: json(row, 9)?,
            discrepancies: json(row, 10)?,
            metadata: json(row, 11)?,
            timestamped: row.get(12)?,
        })
    }

    fn row_to_aggregate(row: &rusqlite::Row) -> rusqlite::Result<AggregateStat> {
        let date: String = row.get(0)?;
        let updated_at: String = row.get(7)?;
        Ok(AggregateStat {
            date: parse_date(0, &date)?,
            primary_service_name: row.get(1)?,
            total_requests: row.get::<_, i64>(2)? as u64,
            status_matches: row.get::<_, i64>(3)? as u64,
            body_matches: row.get::<_, i64>(4)? as u64,
            timed_requests: row.get::<_, i64>(5)? as u64,
            avg_response_time_diff_ms: row.get(6)?,
            updated_at: parse_timestamp(7, &updated_at)?,
        })
    }
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[async_trait]
impl ComparisonStore for SqliteStore {
    async fn insert_record(&self, record: &ComparisonRecord) -> Result<InsertOutcome, StoreError> {
        // Serialize outside the lock
        let request_json = serde_json::to_string(&record.request)?;
        let primary_json = serde_json::to_string(&record.primary_response)?;
        let shadows_json = serde_json::to_string(&record.shadow_responses)?;
        let headers_json = serde_json::to_string(&record.header_differences)?;
        let timing_json = serde_json::to_string(&record.response_time_diff_ms)?;
        let discrepancies_json = serde_json::to_string(&record.discrepancies)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO comparison_records
             (id, request_id, created_at, date, primary_service, method, path,
              status_match, body_match, request_json, primary_response_json,
              shadow_responses_json, header_differences_json, response_time_diff_json,
              discrepancies_json, metadata_json, timestamped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )?;
        let changes = stmt.execute(params![
            &record.id,
            &record.request_id,
            format_timestamp(&record.created_at),
            format_date(record.date()),
            record.primary_service(),
            record.request.method.as_str(),
            &record.request.path,
            record.status_match,
            record.body_match,
            request_json,
            primary_json,
            shadows_json,
            headers_json,
            timing_json,
            discrepancies_json,
            metadata_json,
            record.timestamped,
        ])?;

        Ok(if changes > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    async fn upsert_aggregate(
        &self,
        date: NaiveDate,
        primary_service: &str,
        delta: &AggregateDelta,
    ) -> Result<ApplyOutcome, StoreError> {
        let now = format_timestamp(&Utc::now());
        let (timed, diff) = match delta.response_time_diff_ms {
            Some(d) => (1i64, d as f64),
            None => (0i64, 0.0),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let marked = tx.execute(
            "INSERT OR IGNORE INTO aggregate_applied (record_id, applied_at) VALUES (?1, ?2)",
            params![&delta.record_id, &now],
        )?;
        if marked == 0 {
            tx.rollback()?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        // SET expressions read the pre-update row, so the average uses the old count
        tx.execute(
            "INSERT INTO aggregate_stats
             (date, primary_service, total_requests, status_matches, body_matches,
              timed_requests, avg_response_time_diff_ms, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(date, primary_service) DO UPDATE SET
                total_requests = total_requests + 1,
                status_matches = status_matches + excluded.status_matches,
                body_matches = body_matches + excluded.body_matches,
                timed_requests = timed_requests + excluded.timed_requests,
                avg_response_time_diff_ms = CASE
                    WHEN excluded.timed_requests = 0 THEN avg_response_time_diff_ms
                    ELSE avg_response_time_diff_ms
                        + (excluded.avg_response_time_diff_ms - avg_response_time_diff_ms)
                        / (timed_requests + 1)
                END,
                updated_at = excluded.updated_at",
            params![
                format_date(date),
                primary_service,
                delta.status_match as i64,
                delta.body_match as i64,
                timed,
                diff,
                &now,
            ],
        )?;
        tx.commit()?;

        Ok(ApplyOutcome::Applied)
    }

    async fn get_record(&self, id: &str) -> Result<Option<ComparisonRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM comparison_records WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![id], Self::row_to_record)
            .optional()?)
    }

    async fn find_record(
        &self,
        request_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<ComparisonRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM comparison_records
             WHERE request_id = ?1 AND created_at = ?2"
        ))?;
        Ok(stmt
            .query_row(
                params![request_id, format_timestamp(&created_at)],
                Self::row_to_record,
            )
            .optional()?)
    }

    async fn find_untimestamped_record(
        &self,
        request_id: &str,
    ) -> Result<Option<ComparisonRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM comparison_records
             WHERE request_id = ?1 AND timestamped = 0"
        ))?;
        Ok(stmt
            .query_row(params![request_id], Self::row_to_record)
            .optional()?)
    }

    async fn recent_records(
        &self,
        primary_service: Option<&str>,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ComparisonRecord>, StoreError> {
        let before = before.map(|ts| format_timestamp(&ts));
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM comparison_records
                 WHERE (?1 IS NULL OR primary_service = ?1)
                   AND (?2 IS NULL OR created_at < ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3"
            ),
            params![primary_service, before, limit as i64],
        )
    }

    async fn get_aggregate(
        &self,
        date: NaiveDate,
        primary_service: &str,
    ) -> Result<Option<AggregateStat>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregate_stats
             WHERE date = ?1 AND primary_service = ?2"
        ))?;
        Ok(stmt
            .query_row(
                params![format_date(date), primary_service],
                Self::row_to_aggregate,
            )
            .optional()?)
    }

    async fn list_aggregates(&self, date: NaiveDate) -> Result<Vec<AggregateStat>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregate_stats
             WHERE date = ?1 ORDER BY primary_service"
        ))?;
        let rows = stmt.query_map(params![format_date(date)], Self::row_to_aggregate)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    async fn unaggregated_records(&self, limit: usize) -> Result<Vec<ComparisonRecord>, StoreError> {
        let columns = RECORD_COLUMNS
            .split(", ")
            .map(|c| format!("r.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_records(
            &format!(
                "SELECT {columns} FROM comparison_records r
                 LEFT JOIN aggregate_applied a ON a.record_id = r.id
                 WHERE a.record_id IS NULL
                 ORDER BY r.created_at ASC
                 LIMIT ?1"
            ),
            params![limit as i64],
        )
    }
}
