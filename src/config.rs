//! Service configuration
//!
//! Loaded from TOML, then overridden from the environment. Every field has a
//! default so a partial file (or none) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration for the comparison service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP listen address for ingestion and query endpoints
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SQLite database holding records, aggregates and the ingest spool
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Primary service name used when an event omits it
    #[serde(default = "default_primary_service")]
    pub default_primary_service: String,

    #[serde(default)]
    pub collector: CollectorConfig,

    /// Shadow targets, in comparison order
    #[serde(default)]
    pub shadows: Vec<ShadowTargetConfig>,

    #[serde(default)]
    pub matching: MatchRules,

    #[serde(default)]
    pub persistence: RetryPolicy,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_database_path() -> String {
    "doppelganger.db".to_string()
}

fn default_primary_service() -> String {
    "primary".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_path: default_database_path(),
            default_primary_service: default_primary_service(),
            collector: CollectorConfig::default(),
            shadows: Vec::new(),
            matching: MatchRules::default(),
            persistence: RetryPolicy::default(),
            ingest: IngestConfig::default(),
            aggregation: AggregationConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })
    }

    /// Load from the given path if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::info!(
                "Config file {} not found, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = get("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("DEFAULT_PRIMARY_SERVICE") {
            self.default_primary_service = v;
        }
        if let Some(v) = get("COLLECT_BUDGET_MS") {
            let ms = v.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: "COLLECT_BUDGET_MS",
                reason: e.to_string(),
            })?;
            self.collector.budget = Duration::from_millis(ms);
        }
        if let Some(v) = get("INGEST_WORKERS") {
            self.ingest.workers = v.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
                key: "INGEST_WORKERS",
                reason: e.to_string(),
            })?;
        }
        if let Some(v) = get("SHADOW_TARGETS") {
            self.shadows = parse_shadow_targets(&v)?;
        }
        Ok(())
    }

    /// Shadow targets that take part in comparisons
    pub fn enabled_shadows(&self) -> impl Iterator<Item = &ShadowTargetConfig> {
        self.shadows.iter().filter(|s| s.enabled)
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let enabled: Vec<_> = self.enabled_shadows().collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoShadowTargets);
        }

        let mut seen = std::collections::HashSet::new();
        for shadow in &self.shadows {
            if !seen.insert(shadow.name.as_str()) {
                return Err(ConfigError::DuplicateShadow(shadow.name.clone()));
            }
            let valid_url = reqwest::Url::parse(&shadow.url)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false);
            if shadow.name.trim().is_empty() || !valid_url {
                return Err(ConfigError::InvalidShadowUrl {
                    name: shadow.name.clone(),
                    url: shadow.url.clone(),
                });
            }
        }

        if self.collector.budget.is_zero() {
            return Err(ConfigError::Invalid {
                key: "collector.budget_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "ingest.workers",
                reason: "must be greater than zero".into(),
            });
        }
        if self.persistence.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "persistence.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        if self.default_primary_service.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "default_primary_service",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Parse `name=url,name=url`
fn parse_shadow_targets(raw: &str) -> Result<Vec<ShadowTargetConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, url) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
                key: "SHADOW_TARGETS",
                reason: format!("expected name=url, got `{entry}`"),
            })?;
            Ok(ShadowTargetConfig {
                name: name.trim().to_string(),
                url: url.trim().to_string(),
                enabled: true,
            })
        })
        .collect()
}

/// Shadow collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Overall time budget for collecting every shadow response
    #[serde(rename = "budget_ms", with = "duration_ms", default = "default_budget")]
    pub budget: Duration,
}

fn default_budget() -> Duration {
    Duration::from_millis(2000)
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
        }
    }
}

/// A shadow deployment receiving mirrored traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTargetConfig {
    /// Service name recorded in comparison records
    pub name: String,
    /// Base URL; the mirrored path is appended
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Response matcher rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRules {
    /// Volatile headers excluded from comparison
    #[serde(default = "default_ignored_headers")]
    pub ignored_headers: Vec<String>,
    /// When non-empty, only these headers are compared
    #[serde(default)]
    pub significant_headers: Vec<String>,
    /// Body paths excluded from structural comparison (`meta.timestamp`, `items.*.id`)
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub array_order_sensitive: bool,
}

fn default_ignored_headers() -> Vec<String> {
    [
        "date",
        "x-request-id",
        "request-id",
        "x-trace-id",
        "traceparent",
        "tracestate",
        "x-b3-traceid",
        "x-b3-spanid",
        "x-b3-parentspanid",
        "x-b3-sampled",
        "x-envoy-upstream-service-time",
        "x-amzn-trace-id",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            ignored_headers: default_ignored_headers(),
            significant_headers: Vec::new(),
            ignore_paths: Vec::new(),
            array_order_sensitive: true,
        }
    }
}

/// Retry policy for transient persistence failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Ingestion worker pool and spool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long a delivered event stays invisible before redelivery
    #[serde(rename = "lease_ms", with = "duration_ms", default = "default_lease")]
    pub lease: Duration,
    /// Spool poll interval when no wakeup arrives
    #[serde(rename = "poll_interval_ms", with = "duration_ms", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Delay applied to a nacked event
    #[serde(rename = "redelivery_delay_ms", with = "duration_ms", default = "default_redelivery_delay")]
    pub redelivery_delay: Duration,
}

fn default_workers() -> usize {
    8
}

fn default_lease() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_redelivery_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease: default_lease(),
            poll_interval: default_poll_interval(),
            redelivery_delay: default_redelivery_delay(),
        }
    }
}

/// Aggregate reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(rename = "reconcile_interval_secs", with = "duration_secs", default = "default_reconcile_interval")]
    pub reconcile_interval: Duration,
    #[serde(default = "default_reconcile_batch")]
    pub reconcile_batch: usize,
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reconcile_batch() -> usize {
    500
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            reconcile_batch: default_reconcile_batch(),
        }
    }
}

// Serde helper for Duration (milliseconds)
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
