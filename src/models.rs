//! Comparison record model
//!
//! Canonical representation of one mirrored request, the primary response, every
//! shadow result and the diff outcome. Records are write-once; aggregates are
//! derived from them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// HTTP verbs accepted on mirrored requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Connect,
    Trace,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            "CONNECT" => Ok(HttpMethod::Connect),
            "TRACE" => Ok(HttpMethod::Trace),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header multimap. Keys are stored lower-cased, values keep arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping earlier values for repeated headers
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0
            .entry(key.trim().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(&key.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k.as_ref(), v);
        }
        headers
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Relay logs carry single strings, the comparison schema carries lists.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
        let mut headers = Headers::new();
        for (key, values) in raw {
            match values {
                OneOrMany::One(v) => headers.append(&key, v),
                OneOrMany::Many(vs) => {
                    for v in vs {
                        headers.append(&key, v);
                    }
                }
            }
        }
        Ok(headers)
    }
}

/// Opaque message body.
///
/// Serialized as a JSON string when the bytes are valid UTF-8, otherwise as
/// `{"base64": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Body(Vec<u8>);

impl Body {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl Serialize for Body {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.as_str() {
            Some(text) => serializer.serialize_str(text),
            None => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("base64", &BASE64.encode(&self.0))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawBody {
            Text(String),
            Encoded { base64: String },
        }

        match RawBody::deserialize(deserializer)? {
            RawBody::Text(text) => Ok(Body(text.into_bytes())),
            RawBody::Encoded { base64 } => BASE64
                .decode(base64.as_bytes())
                .map(Body)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// The mirrored request as replayed against shadows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    /// Path including any query string
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

/// The authoritative response returned to the real caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryResponse {
    pub service_name: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    pub response_time_ms: u64,
}

/// A response captured from one shadow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    pub response_time_ms: u64,
}

/// Why a shadow produced no response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionError,
    MalformedResponse,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionError => "connection_error",
            FailureKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure marker recorded in place of a shadow response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ShadowFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ShadowFailure {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ConnectionError,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::MalformedResponse,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShadowOutcome {
    Responded(ShadowResponse),
    Failed(ShadowFailure),
}

/// One slot of the shadow result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowResult {
    pub service_name: String,
    pub outcome: ShadowOutcome,
}

impl ShadowResult {
    pub fn responded(service_name: impl Into<String>, response: ShadowResponse) -> Self {
        Self {
            service_name: service_name.into(),
            outcome: ShadowOutcome::Responded(response),
        }
    }

    pub fn failed(service_name: impl Into<String>, failure: ShadowFailure) -> Self {
        Self {
            service_name: service_name.into(),
            outcome: ShadowOutcome::Failed(failure),
        }
    }

    pub fn response(&self) -> Option<&ShadowResponse> {
        match &self.outcome {
            ShadowOutcome::Responded(r) => Some(r),
            ShadowOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ShadowFailure> {
        match &self.outcome {
            ShadowOutcome::Failed(f) => Some(f),
            ShadowOutcome::Responded(_) => None,
        }
    }
}

/// Where a discrepancy was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum DiffLocation {
    Status,
    Header(String),
    /// Body path rendered as `$.a.b[2]`
    Body(String),
    /// The shadow response as a whole (failure markers)
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffReason {
    StatusMismatch,
    HeaderMismatch,
    HeaderMissing,
    ValueMismatch,
    TypeMismatch,
    MissingInShadow,
    MissingInPrimary,
    LengthMismatch,
    Unparseable,
    Timeout,
    ConnectionError,
    MalformedResponse,
}

impl From<FailureKind> for DiffReason {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => DiffReason::Timeout,
            FailureKind::ConnectionError => DiffReason::ConnectionError,
            FailureKind::MalformedResponse => DiffReason::MalformedResponse,
        }
    }
}

/// A single field-level difference between primary and shadow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub location: DiffLocation,
    pub reason: DiffReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<serde_json::Value>,
}

/// Header discrepancy. An empty side means the header was absent there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderDifference {
    pub key: String,
    pub primary: Vec<String>,
    pub shadow: Vec<String>,
}

/// Immutable outcome of one completed comparison attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRecord {
    pub id: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    /// False when `created_at` is the receipt time; unique per `request_id` then
    #[serde(default = "default_timestamped")]
    pub timestamped: bool,
    pub request: RequestDescriptor,
    pub primary_response: PrimaryResponse,
    pub shadow_responses: Vec<ShadowResult>,
    pub status_match: bool,
    pub body_match: bool,
    pub header_differences: BTreeMap<String, Vec<HeaderDifference>>,
    pub response_time_diff_ms: BTreeMap<String, i64>,
    #[serde(default)]
    pub discrepancies: BTreeMap<String, Vec<Discrepancy>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_timestamped() -> bool {
    true
}

impl ComparisonRecord {
    /// Aggregation day of this record
    pub fn date(&self) -> NaiveDate {
        self.created_at.date_naive()
    }

    pub fn primary_service(&self) -> &str {
        &self.primary_response.service_name
    }

    /// Representative timing delta: the per-shadow value with the largest
    /// magnitude, first shadow in record order winning ties.
    pub fn timing_delta_ms(&self) -> Option<i64> {
        self.shadow_responses
            .iter()
            .filter_map(|s| self.response_time_diff_ms.get(&s.service_name).copied())
            .fold(None, |best: Option<i64>, d| match best {
                Some(b) if b.unsigned_abs() >= d.unsigned_abs() => Some(b),
                _ => Some(d),
            })
    }
}

/// Canonical `created_at` encoding used for the idempotency key
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Records are keyed at millisecond precision
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Per-day, per-primary-service rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStat {
    pub date: NaiveDate,
    pub primary_service_name: String,
    pub total_requests: u64,
    pub status_matches: u64,
    pub body_matches: u64,
    pub timed_requests: u64,
    pub avg_response_time_diff_ms: f64,
    pub updated_at: DateTime<Utc>,
}

/// The contribution of one record to its aggregate row
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDelta {
    pub record_id: String,
    pub status_match: bool,
    pub body_match: bool,
    pub response_time_diff_ms: Option<i64>,
}

impl AggregateDelta {
    pub fn from_record(record: &ComparisonRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            status_match: record.status_match,
            body_match: record.body_match,
            response_time_diff_ms: record.timing_delta_ms(),
        }
    }
}
