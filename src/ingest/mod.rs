//! Mirrored-traffic ingestion
//!
//! Events arrive over an at-least-once channel. A delivery is acknowledged only
//! after the engine persisted its record or definitively rejected it; anything else
//! is nacked and redelivered.

pub mod event;
pub mod memory;
pub mod spool;
pub mod worker;

pub use event::{ComparisonRequest, InboundEvent};
pub use memory::MemoryQueue;
pub use spool::SqliteSpool;
pub use worker::IngestWorkers;

use async_trait::async_trait;

use crate::error::StoreError;

/// One delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque handle for ack/nack
    pub token: u64,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub attempt: u32,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next available event
    async fn next(&self) -> Result<Delivery, StoreError>;

    /// Processing reached a terminal outcome; never redeliver
    async fn ack(&self, token: u64) -> Result<(), StoreError>;

    /// Processing failed; redeliver later
    async fn nack(&self, token: u64) -> Result<(), StoreError>;
}
