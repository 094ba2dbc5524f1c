//! Shadow targets
//!
//! A target replays a mirrored request and reports either a captured response or a
//! failure marker. Failures are values, never errors.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::HOP_BY_HOP_HEADERS;
use crate::models::{Body, Headers, RequestDescriptor, ShadowFailure, ShadowResponse};

#[async_trait]
pub trait ShadowTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Replay `request`, giving up at `deadline`
    async fn invoke(
        &self,
        request: &RequestDescriptor,
        deadline: Instant,
    ) -> Result<ShadowResponse, ShadowFailure>;
}

/// Forwards mirrored requests to a shadow deployment over HTTP
pub struct HttpShadowTarget {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpShadowTarget {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Shared client for all targets; per-request timeouts come from the deadline
    pub fn default_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

fn classify(err: reqwest::Error) -> ShadowFailure {
    if err.is_timeout() {
        ShadowFailure::timeout(err.to_string())
    } else if err.is_body() || err.is_decode() {
        ShadowFailure::malformed(err.to_string())
    } else {
        ShadowFailure::connection(err.to_string())
    }
}

#[async_trait]
impl ShadowTarget for HttpShadowTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        request: &RequestDescriptor,
        deadline: Instant,
    ) -> Result<ShadowResponse, ShadowFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ShadowFailure::timeout("deadline passed before dispatch"));
        }

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| ShadowFailure::connection(e.to_string()))?;
        let mut builder = self
            .client
            .request(method, self.url_for(&request.path))
            .timeout(remaining);

        for (key, values) in request.headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&key) {
                continue;
            }
            for value in values {
                builder = builder.header(key, value.as_str());
            }
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.as_bytes().to_vec());
        }

        let started = std::time::Instant::now();
        let response = builder.send().await.map_err(classify)?;
        let status_code = response.status().as_u16();

        let mut headers = Headers::new();
        for (key, value) in response.headers() {
            let value = value
                .to_str()
                .map_err(|e| ShadowFailure::malformed(format!("header {key}: {e}")))?;
            headers.append(key.as_str(), value);
        }

        let bytes = response.bytes().await.map_err(classify)?;
        let response_time_ms = started.elapsed().as_millis() as u64;
        debug!(shadow = %self.name, status = status_code, response_time_ms, "shadow responded");

        Ok(ShadowResponse {
            status_code,
            headers,
            body: (!bytes.is_empty()).then(|| Body::from_bytes(bytes.to_vec())),
            response_time_ms,
        })
    }
}
