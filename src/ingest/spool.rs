//! Durable ingest spool
//!
//! Accepted events are written to SQLite before the HTTP caller gets its 202. A
//! delivered row is leased, not removed; it disappears on ack and becomes visible
//! again when nacked or when its lease expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::event::stamp_received_at;
use super::{Delivery, EventSource};
use crate::config::IngestConfig;
use crate::error::{EnqueueError, StoreError};
use crate::models::format_timestamp;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS ingest_spool (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_spool_available
    ON ingest_spool(available_at, seq);
"#;

pub struct SqliteSpool {
    conn: Arc<Mutex<Connection>>,
    notify: Notify,
    lease: Duration,
    poll_interval: Duration,
    redelivery_delay: Duration,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteSpool {
    pub fn open(db_path: &str, config: &IngestConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open spool at {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize spool schema")?;

        let backlog: i64 = conn
            .query_row("SELECT COUNT(*) FROM ingest_spool", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, backlog, "ingest spool opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Notify::new(),
            lease: config.lease,
            poll_interval: config.poll_interval,
            redelivery_delay: config.redelivery_delay,
        })
    }

    /// Durably accept one raw event, returning its sequence number
    pub fn enqueue(&self, payload: &[u8]) -> Result<u64, EnqueueError> {
        let now = Utc::now();
        let stamped = stamp_received_at(payload, now)?;

        let seq = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "INSERT INTO ingest_spool (payload, enqueued_at, attempts, available_at)
                 VALUES (?1, ?2, 0, ?3)",
            )?;
            stmt.execute(params![stamped, format_timestamp(&now), now.timestamp_millis()])
                .map_err(StoreError::from)?;
            conn.last_insert_rowid() as u64
        };
        self.notify.notify_one();
        debug!(seq, "event spooled");
        Ok(seq)
    }

    /// Rows not yet acknowledged, leased or not
    pub fn depth(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ingest_spool", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn lease_next(&self) -> Result<Option<Delivery>, StoreError> {
        let now = now_ms();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "UPDATE ingest_spool
             SET available_at = ?2, attempts = attempts + 1
             WHERE seq = (
                 SELECT seq FROM ingest_spool
                 WHERE available_at <= ?1
                 ORDER BY seq
                 LIMIT 1
             )
             RETURNING seq, payload, attempts",
        )?;
        let delivery = stmt
            .query_row(params![now, now + self.lease.as_millis() as i64], |row| {
                Ok(Delivery {
                    token: row.get::<_, i64>(0)? as u64,
                    payload: row.get(1)?,
                    attempt: row.get::<_, i64>(2)? as u32,
                })
            })
            .optional()?;
        Ok(delivery)
    }
}

#[async_trait]
impl EventSource for SqliteSpool {
    async fn next(&self) -> Result<Delivery, StoreError> {
        loop {
            if let Some(delivery) = self.lease_next()? {
                return Ok(delivery);
            }
            // Expired leases and delayed nacks only show up by polling
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, token: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.prepare_cached("DELETE FROM ingest_spool WHERE seq = ?1")?
            .execute(params![token as i64])?;
        Ok(())
    }

    async fn nack(&self, token: u64) -> Result<(), StoreError> {
        let available_at = now_ms() + self.redelivery_delay.as_millis() as i64;
        let conn = self.conn.lock();
        conn.prepare_cached("UPDATE ingest_spool SET available_at = ?2 WHERE seq = ?1")?
            .execute(params![token as i64, available_at])?;
        Ok(())
    }
}
