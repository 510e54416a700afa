//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! This module provides:
//! - A `/metrics` endpoint that returns Prometheus-formatted metrics
//! - Middleware for tracking HTTP request counts and durations
//! - Helper functions to record description, credit and batch metrics

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::TransactionType;
use crate::AppState;

// Metric names as constants for consistency
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const DESCRIPTIONS_TOTAL: &str = "descriptions_total";
pub const VISION_REQUEST_DURATION_SECONDS: &str = "vision_request_duration_seconds";
pub const CREDITS_DEDUCTED_TOTAL: &str = "credits_deducted_total";
pub const CREDITS_ADDED_TOTAL: &str = "credits_added_total";
pub const BATCHES_TOTAL: &str = "batches_total";
pub const USERS_TOTAL: &str = "users_total";
pub const PAYMENT_REQUESTS_PENDING: &str = "payment_requests_pending";

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Fails if a recorder is already installed in this process.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        DESCRIPTIONS_TOTAL,
        "Image descriptions attempted, by source and status (success/failed)"
    );
    describe_histogram!(
        VISION_REQUEST_DURATION_SECONDS,
        "Latency of calls to the vision provider in seconds"
    );
    describe_counter!(CREDITS_DEDUCTED_TOTAL, "Credits consumed by descriptions");
    describe_counter!(CREDITS_ADDED_TOTAL, "Credits added, by transaction type");
    describe_counter!(BATCHES_TOTAL, "Batch uploads processed, by mode");
    describe_gauge!(USERS_TOTAL, "Number of registered users");
    describe_gauge!(
        PAYMENT_REQUESTS_PENDING,
        "Payment requests waiting for an admin decision"
    );

    Ok(handle)
}

/// GET /metrics - Returns Prometheus-formatted metrics.
///
/// This endpoint is accessible without authentication.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

async fn update_gauge_metrics(state: &AppState) {
    if let Ok(count) = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
        .fetch_one(&state.db)
        .await
    {
        gauge!(USERS_TOTAL).set(count as f64);
    }

    if let Ok(count) = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM payment_requests WHERE status = 'pending'",
    )
    .fetch_one(&state.db)
    .await
    {
        gauge!(PAYMENT_REQUESTS_PENDING).set(count as f64);
    }
}

/// Middleware to track HTTP request metrics.
///
/// Records:
/// - `http_requests_total` counter with method, path, and status labels
/// - `http_request_duration_seconds` histogram with method and path labels
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Use the matched route template so ids don't explode label cardinality
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_description_success(source: &'static str) {
    counter!(DESCRIPTIONS_TOTAL, "source" => source, "status" => "success").increment(1);
}

pub fn record_description_failed() {
    counter!(DESCRIPTIONS_TOTAL, "source" => "none", "status" => "failed").increment(1);
}

pub fn record_vision_request(outcome: &'static str, elapsed: Duration) {
    histogram!(VISION_REQUEST_DURATION_SECONDS, "outcome" => outcome).record(elapsed.as_secs_f64());
}

pub fn record_credits_deducted(amount: i64) {
    if amount > 0 {
        counter!(CREDITS_DEDUCTED_TOTAL).increment(amount as u64);
    }
}

pub fn record_credits_added(transaction_type: TransactionType, amount: i64) {
    if amount > 0 {
        counter!(CREDITS_ADDED_TOTAL, "type" => transaction_type.to_string()).increment(amount as u64);
    }
}

pub fn record_batch(mode: &'static str) {
    counter!(BATCHES_TOTAL, "mode" => mode).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        // Prometheus naming conventions
        assert!(HTTP_REQUESTS_TOTAL.ends_with("_total"));
        assert!(DESCRIPTIONS_TOTAL.ends_with("_total"));
        assert!(CREDITS_DEDUCTED_TOTAL.ends_with("_total"));
        assert!(HTTP_REQUEST_DURATION_SECONDS.ends_with("_seconds"));
        assert!(VISION_REQUEST_DURATION_SECONDS.ends_with("_seconds"));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_description_success("ideogram");
        record_credits_deducted(3);
        record_credits_added(TransactionType::Bonus, 0);
        record_vision_request("success", Duration::from_millis(10));
    }
}
