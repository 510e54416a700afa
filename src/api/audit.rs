//! Audit log API endpoints and helpers.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::db::{list_audit_logs, log_audit, AuditEntry, AuditLogListResponse, AuditLogQuery};
use crate::AppState;

use super::error::ApiError;

/// Client IP from proxy headers, if any
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first_ip) = forwarded.split(',').next() {
            let ip = first_ip.trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Record an audit entry. Failures are logged, never surfaced to the caller.
pub async fn audit_log(state: &AppState, entry: AuditEntry<'_>) {
    let action = entry.action;
    let resource_type = entry.resource_type;
    if let Err(e) = log_audit(&state.db, entry).await {
        tracing::warn!(
            action = action,
            resource_type = resource_type,
            error = %e,
            "Failed to create audit log entry"
        );
    }
}

/// List audit logs with filtering and pagination
///
/// Query parameters:
/// - action: Filter by action type (e.g., "payment.approve")
/// - resource_type: Filter by resource type (e.g., "user", "setting")
/// - resource_id: Filter by specific resource ID
/// - user_id: Filter by acting user
/// - page / per_page: 1-indexed pagination (per_page max 100)
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogListResponse>, ApiError> {
    let result = list_audit_logs(&state.db, &query).await?;
    Ok(Json(result))
}
