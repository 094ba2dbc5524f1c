//! Error taxonomy
//!
//! Shadow failures are data (see `models::ShadowFailure`) and never appear here.

use thiserror::Error;

/// Inbound event could not be turned into a comparison request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event is not valid JSON: {0}")]
    Malformed(String),
    #[error("event is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("event field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Storage failures. Duplicate keys are outcomes, not errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient: busy database, I/O hiccup. Safe to retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A stored row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// An event could not be accepted onto the ingest spool
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for EnqueueError {
    fn from(e: rusqlite::Error) -> Self {
        EnqueueError::Store(StoreError::from(e))
    }
}

/// A comparison that could not reach a terminal acknowledged state
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("persistence failed after {attempts} attempts: {source}")]
    Persistence {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Startup-fatal configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no shadow targets configured")]
    NoShadowTargets,
    #[error("shadow target `{0}` is configured more than once")]
    DuplicateShadow(String),
    #[error("shadow target `{name}` has invalid url `{url}`")]
    InvalidShadowUrl { name: String, url: String },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
