//! Request logging middleware.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Log method, path, status and latency for every request.
///
/// Health and metrics scrapes are logged at DEBUG to keep INFO readable.
pub async fn request_logging_simple(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms, "Request failed (5xx)");
    } else if path == "/health" || path == "/metrics" {
        debug!(method = %method, path = %path, status, latency_ms, "Request completed");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "Request completed");
    }

    response
}
