//! Doppelganger
//!
//! Shadow-traffic comparison service: replays mirrored requests against shadow
//! deployments, diffs every response with the primary's, and keeps durable
//! per-request records plus per-day rollups.

pub mod api;
pub mod comparison;
pub mod config;
pub mod error;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod storage;

pub use comparison::{ComparisonEngine, ProcessOutcome};
pub use config::ServiceConfig;
