//! Inbound mirrored-traffic events
//!
//! Accepts the camelCase comparison schema and the relay log format through field
//! aliases. Every field is optional at decode time so validation can name the one
//! that is missing.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::models::{truncate_to_millis, Body, Headers, HttpMethod, PrimaryResponse, RequestDescriptor};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(default, alias = "request_id")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, alias = "request_headers", skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Headers>,
    #[serde(default, alias = "request_body", skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Body>,
    #[serde(default, alias = "service_name", skip_serializing_if = "Option::is_none")]
    pub primary_service_name: Option<String>,
    #[serde(default, alias = "response_status")]
    pub primary_status_code: Option<i64>,
    #[serde(default, alias = "response_headers", skip_serializing_if = "Option::is_none")]
    pub primary_response_headers: Option<Headers>,
    #[serde(default, alias = "response_body", skip_serializing_if = "Option::is_none")]
    pub primary_response_body: Option<Body>,
    #[serde(default, alias = "response_time_ms")]
    pub primary_response_time_ms: Option<i64>,
    #[serde(default, alias = "shadow_targets", skip_serializing_if = "Vec::is_empty")]
    pub shadow_targets: Vec<String>,
    /// RFC 3339 string or epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Set by the spool on acceptance; stands in for a missing `timestamp`
    #[serde(default, alias = "received_at", skip_serializing_if = "Option::is_none")]
    pub received_at: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// A validated event, ready for shadow collection
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonRequest {
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    /// False when `created_at` is a receipt time; the request id alone is then the identity
    pub timestamped: bool,
    pub request: RequestDescriptor,
    pub primary: PrimaryResponse,
    /// Shadow names requested by the event; empty means every configured shadow
    pub shadow_targets: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl InboundEvent {
    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Validate required fields.
    ///
    /// Without a `timestamp`, `created_at` is the spool's `receivedAt` stamp, else `received_at`.
    pub fn validate(
        self,
        default_primary_service: &str,
        received_at: DateTime<Utc>,
    ) -> Result<ComparisonRequest, ValidationError> {
        let request_id = non_empty(self.request_id).ok_or(ValidationError::MissingField("requestId"))?;

        let method = non_empty(self.method)
            .ok_or(ValidationError::MissingField("method"))?
            .parse::<HttpMethod>()
            .map_err(|reason| ValidationError::InvalidField {
                field: "method",
                reason,
            })?;

        let path = non_empty(self.path).ok_or(ValidationError::MissingField("path"))?;
        if !path.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field: "path",
                reason: format!("`{path}` is not an absolute path"),
            });
        }

        let status = self
            .primary_status_code
            .ok_or(ValidationError::MissingField("primaryStatusCode"))?;
        let status_code = u16::try_from(status)
            .ok()
            .filter(|s| (100..=599).contains(s))
            .ok_or_else(|| ValidationError::InvalidField {
                field: "primaryStatusCode",
                reason: format!("{status} is not an HTTP status"),
            })?;

        let time = self
            .primary_response_time_ms
            .ok_or(ValidationError::MissingField("primaryResponseTimeMs"))?;
        let response_time_ms = u64::try_from(time).map_err(|_| ValidationError::InvalidField {
            field: "primaryResponseTimeMs",
            reason: format!("{time} is negative"),
        })?;

        let (created_at, timestamped) = match (&self.timestamp, &self.received_at) {
            (Some(ts), _) if !ts.is_null() => (parse_timestamp(ts, "timestamp")?, true),
            (_, Some(ts)) if !ts.is_null() => (parse_timestamp(ts, "receivedAt")?, false),
            _ => (received_at, false),
        };

        let service_name = non_empty(self.primary_service_name)
            .unwrap_or_else(|| default_primary_service.to_string());

        let shadow_targets = self
            .shadow_targets
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(ComparisonRequest {
            request_id,
            created_at: truncate_to_millis(created_at),
            timestamped,
            request: RequestDescriptor {
                method,
                path,
                headers: self.request_headers.unwrap_or_default(),
                body: self.request_body.filter(|b| !b.is_empty()),
            },
            primary: PrimaryResponse {
                service_name,
                status_code,
                headers: self.primary_response_headers.unwrap_or_default(),
                body: self.primary_response_body.filter(|b| !b.is_empty()),
                response_time_ms,
            },
            shadow_targets,
            metadata: self.metadata,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_timestamp(value: &Value, field: &'static str) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        field,
        reason,
    };
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| invalid(format!("`{s}`: {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| invalid(format!("{n} is not epoch milliseconds"))),
        other => Err(invalid(format!("unsupported value {other}"))),
    }
}

/// Record the acceptance time of a raw JSON event as `receivedAt`.
///
/// The producer's `timestamp` is left alone. A `receivedAt` already present (a
/// re-spooled event) is kept. Non-object payloads are returned unchanged and
/// rejected later by validation.
pub fn stamp_received_at(payload: &[u8], now: DateTime<Utc>) -> Result<Vec<u8>, ValidationError> {
    let mut value: Value =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        let missing = map.get("receivedAt").map_or(true, Value::is_null);
        if missing {
            map.insert(
                "receivedAt".into(),
                Value::String(crate::models::format_timestamp(&truncate_to_millis(now))),
            );
        }
    }
    serde_json::to_vec(&value).map_err(|e| ValidationError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn valid() -> Value {
        json!({
            "requestId": "req-1",
            "method": "post",
            "path": "/orders",
            "requestHeaders": {"Content-Type": "application/json"},
            "requestBody": "{\"qty\":1}",
            "primaryServiceName": "orders-v1",
            "primaryStatusCode": 201,
            "primaryResponseHeaders": {"X-Version": ["1"]},
            "primaryResponseBody": {"base64": "eyJpZCI6N30="},
            "primaryResponseTimeMs": 42,
            "shadowTargets": ["orders-v2"],
            "timestamp": "2025-06-01T10:00:00.123456Z",
            "metadata": {"traceId": "abc"}
        })
    }

    fn decode(value: Value) -> InboundEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_event() {
        let req = decode(valid()).validate("primary", now()).unwrap();
        assert!(req.timestamped);
        assert_eq!(req.request.method, HttpMethod::Post);
        assert_eq!(req.primary.status_code, 201);
        assert_eq!(req.primary.body.unwrap().as_str(), Some(r#"{"id":7}"#));
        assert_eq!(req.shadow_targets, vec!["orders-v2"]);
        assert_eq!(
            crate::models::format_timestamp(&req.created_at),
            "2025-06-01T10:00:00.123Z"
        );
        assert_eq!(req.metadata["traceId"], "abc");
    }

    #[test]
    fn test_relay_log_aliases() {
        let relay = json!({
            "request_id": "r-9",
            "service_name": "users-v1",
            "timestamp": 1748772000000i64,
            "method": "GET",
            "path": "/users/1",
            "request_headers": {"Accept": "*/*"},
            "response_status": 200,
            "response_headers": {"Content-Type": "application/json"},
            "response_body": "{}",
            "response_time_ms": 12
        });
        let req = decode(relay).validate("primary", now()).unwrap();
        assert_eq!(req.request_id, "r-9");
        assert_eq!(req.primary.service_name, "users-v1");
        assert_eq!(req.created_at.timestamp_millis(), 1748772000000);
        assert!(req.shadow_targets.is_empty());
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let mut v = valid();
        v.as_object_mut().unwrap().remove("requestId");
        assert_eq!(
            decode(v).validate("p", now()),
            Err(ValidationError::MissingField("requestId"))
        );

        let mut v = valid();
        v["primaryStatusCode"] = json!(1000);
        assert!(matches!(
            decode(v).validate("p", now()),
            Err(ValidationError::InvalidField { field: "primaryStatusCode", .. })
        ));

        let mut v = valid();
        v["primaryResponseTimeMs"] = json!(-1);
        assert!(decode(v).validate("p", now()).is_err());

        let mut v = valid();
        v["method"] = json!("BREW");
        assert!(decode(v).validate("p", now()).is_err());

        assert!(matches!(
            InboundEvent::from_slice(b"not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let mut v = valid();
        let obj = v.as_object_mut().unwrap();
        obj.remove("primaryServiceName");
        obj.remove("timestamp");
        let req = decode(v).validate("fallback", now()).unwrap();
        assert_eq!(req.primary.service_name, "fallback");
        assert_eq!(req.created_at, now());
        assert!(!req.timestamped);
    }

    #[test]
    fn test_received_at_stands_in_for_timestamp() {
        let mut v = valid();
        let obj = v.as_object_mut().unwrap();
        obj.remove("timestamp");
        obj.insert("receivedAt".into(), json!("2025-06-01T09:30:00.000Z"));
        let req = decode(v).validate("p", now()).unwrap();
        assert!(!req.timestamped);
        assert_eq!(
            crate::models::format_timestamp(&req.created_at),
            "2025-06-01T09:30:00.000Z"
        );

        // A producer timestamp wins over the receipt stamp
        let mut v = valid();
        v["receivedAt"] = json!("2025-06-01T09:30:00.000Z");
        let req = decode(v).validate("p", now()).unwrap();
        assert!(req.timestamped);
        assert_eq!(req.created_at.timestamp_millis() % 1000, 123);
    }

    #[test]
    fn test_stamp_received_at_only_when_missing() {
        let stamped = stamp_received_at(br#"{"requestId":"a","timestamp":5}"#, now()).unwrap();
        let v: Value = serde_json::from_slice(&stamped).unwrap();
        assert_eq!(v["receivedAt"], "2025-06-01T12:00:00.000Z");
        assert_eq!(v["timestamp"], 5);

        let kept = stamp_received_at(br#"{"receivedAt":"2020-01-01T00:00:00Z"}"#, now()).unwrap();
        let v: Value = serde_json::from_slice(&kept).unwrap();
        assert_eq!(v["receivedAt"], "2020-01-01T00:00:00Z");

        assert!(stamp_received_at(b"{", now()).is_err());
    }
}
