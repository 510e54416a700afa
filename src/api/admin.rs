use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use super::error::ApiError;
use crate::db::{fetch_system_stats, find_ledger_mismatches, LedgerMismatch, SystemStats};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub consistent: bool,
    pub mismatches: Vec<LedgerMismatch>,
}

/// GET /api/admin/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<SystemStats>, ApiError> {
    Ok(Json(fetch_system_stats(&state.db).await?))
}

/// GET /api/admin/ledger/reconcile
pub async fn reconcile(State(state): State<Arc<AppState>>) -> Result<Json<ReconcileResponse>, ApiError> {
    let mismatches = find_ledger_mismatches(&state.db).await?;
    if !mismatches.is_empty() {
        tracing::error!(count = mismatches.len(), "Ledger mismatches found");
    }
    Ok(Json(ReconcileResponse {
        consistent: mismatches.is_empty(),
        mismatches,
    }))
}
