//! Ingest worker pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Delivery, EventSource};
use crate::comparison::ComparisonEngine;

/// Pause after the source itself errors, doubling up to the cap
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_SOURCE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub source_errors: AtomicU64,
}

/// N tasks pulling deliveries from one source into one engine
pub struct IngestWorkers {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    stats: Arc<WorkerStats>,
}

impl IngestWorkers {
    pub fn spawn(
        count: usize,
        source: Arc<dyn EventSource>,
        engine: Arc<ComparisonEngine>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());

        let handles = (0..count)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    source.clone(),
                    engine.clone(),
                    stats.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();
        info!(workers = count, "ingest workers started");

        Self {
            handles,
            shutdown,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Stop pulling new deliveries and wait for in-flight ones to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("ingest worker panicked: {}", e);
            }
        }
        info!("ingest workers stopped");
    }
}

async fn run_worker(
    id: usize,
    source: Arc<dyn EventSource>,
    engine: Arc<ComparisonEngine>,
    stats: Arc<WorkerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut retry_delay = SOURCE_RETRY_DELAY;
    loop {
        let next = tokio::select! {
            next = source.next() => next,
            _ = shutdown.changed() => break,
        };

        match next {
            Ok(delivery) => {
                retry_delay = SOURCE_RETRY_DELAY;
                handle_delivery(id, source.as_ref(), &engine, &stats, delivery).await;
            }
            Err(e) => {
                stats.source_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker = id, "event source error, retrying in {:?}: {}", retry_delay, e);
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = shutdown.changed() => break,
                }
                retry_delay = (retry_delay * 2).min(MAX_SOURCE_RETRY_DELAY);
            }
        }
    }
    debug!(worker = id, "ingest worker exiting");
}

async fn handle_delivery(
    id: usize,
    source: &dyn EventSource,
    engine: &ComparisonEngine,
    stats: &WorkerStats,
    delivery: Delivery,
) {
    let token = delivery.token;
    match engine.process_payload(&delivery.payload).await {
        Ok(outcome) => {
            debug!(worker = id, token, attempt = delivery.attempt, ?outcome, "delivery done");
            stats.acked.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = source.ack(token).await {
                // Redelivery resolves to the stored record
                warn!(worker = id, token, "ack failed: {}", e);
            }
        }
        Err(e) => {
            warn!(worker = id, token, attempt = delivery.attempt, "comparison failed, nacking: {}", e);
            stats.nacked.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = source.nack(token).await {
                warn!(worker = id, token, "nack failed: {}", e);
            }
        }
    }
}
