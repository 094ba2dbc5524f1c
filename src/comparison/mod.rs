//! Request replication and response comparison
//!
//! - `target`: replays a mirrored request against one shadow
//! - `collector`: concurrent fan-out under one deadline
//! - `body` / `matcher`: pure structural diff of two responses
//! - `engine`: per-event state machine producing comparison records
//! - `aggregator`: idempotent per-day rollups and reconciliation
//! - `metrics`: Prometheus counters for all of the above

pub mod aggregator;
pub mod body;
pub mod collector;
pub mod engine;
pub mod matcher;
pub mod metrics;
pub mod target;

pub use aggregator::Aggregator;
pub use body::{BodyRules, IgnorePath};
pub use collector::{ShadowCollector, ShadowSlot};
pub use engine::{ComparisonEngine, ComparisonStage, ProcessOutcome};
pub use matcher::{MatchOutcome, ResponseMatcher};
pub use metrics::{ComparisonMetrics, LatencyHistogram};
pub use target::{HttpShadowTarget, ShadowTarget};

/// Connection-level headers never forwarded to shadows nor compared
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "upgrade",
    "proxy-connection",
    "transfer-encoding",
    "keep-alive",
    "te",
    "trailer",
];
