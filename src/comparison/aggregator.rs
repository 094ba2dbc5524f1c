//! Daily aggregates
//!
//! Counters live in storage and change only through [`ComparisonStore::upsert_aggregate`],
//! which applies each record id at most once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::metrics::ComparisonMetrics;
use crate::error::StoreError;
use crate::models::{AggregateDelta, ComparisonRecord};
use crate::storage::{ApplyOutcome, ComparisonStore};

pub struct Aggregator {
    store: Arc<dyn ComparisonStore>,
    metrics: Arc<ComparisonMetrics>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn ComparisonStore>, metrics: Arc<ComparisonMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Fold one record into its `(date, primary service)` row
    pub async fn apply(&self, record: &ComparisonRecord) -> Result<ApplyOutcome, StoreError> {
        let delta = AggregateDelta::from_record(record);
        let outcome = self
            .store
            .upsert_aggregate(record.date(), record.primary_service(), &delta)
            .await?;

        match outcome {
            ApplyOutcome::Applied => {
                ComparisonMetrics::incr(&self.metrics.aggregations_applied);
                debug!(record_id = %record.id, date = %record.date(), "aggregate applied");
            }
            ApplyOutcome::AlreadyApplied => {
                debug!(record_id = %record.id, "aggregate already applied");
            }
        }
        Ok(outcome)
    }

    /// Apply up to `limit` persisted records that were never aggregated.
    ///
    /// Returns how many were applied by this pass.
    pub async fn reconcile(&self, limit: usize) -> Result<usize, StoreError> {
        let pending = self.store.unaggregated_records(limit).await?;
        let mut applied = 0;
        for record in &pending {
            if self.apply(record).await? == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        if applied > 0 {
            info!(applied, "reconciled unaggregated records");
        }
        Ok(applied)
    }

    /// Reconcile on an interval until shutdown
    pub async fn run_reconciliation(
        self: Arc<Self>,
        every: Duration,
        batch: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Drain in batches so a large backlog clears in one tick
                    loop {
                        match self.reconcile(batch).await {
                            Ok(n) if n == batch && batch > 0 => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!("reconciliation pass failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("reconciliation stopped");
                        return;
                    }
                }
            }
        }
    }
}
