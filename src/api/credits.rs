//! Balance, own ledger history, and purchasable packages.

use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use super::error::ApiError;
use crate::config::CreditPackage;
use crate::db::{list_user_transactions, BalanceResponse, CreditTransaction, PageQuery, Paginated, User};
use crate::ledger;
use crate::AppState;

/// GET /api/credits
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<BalanceResponse>, ApiError> {
    let credits = ledger::balance(&state.db, &user.id).await?;
    Ok(Json(BalanceResponse { credits }))
}

/// GET /api/credits/transactions
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(page): Query<PageQuery>,
) -> Result<Json<Paginated<CreditTransaction>>, ApiError> {
    Ok(Json(list_user_transactions(&state.db, &user.id, &page).await?))
}

/// GET /api/credits/packages
pub async fn list_packages(State(state): State<Arc<AppState>>) -> Json<Vec<CreditPackage>> {
    Json(state.config.credits.packages.clone())
}
