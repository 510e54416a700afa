//! Admin user management and credit adjustments.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use super::audit::{audit_log, extract_client_ip};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::validate_name;
use crate::db::{
    actions, delete_user_sessions, find_user_by_id, list_user_transactions, list_users,
    resource_types, update_user, AdjustCreditsRequest, AuditEntry, CreditTransaction, PageQuery,
    Paginated, UpdateUserRequest, User, UserListQuery, UserResponse,
};
use crate::ledger;
use crate::AppState;

/// GET /api/admin/users?search=&role=
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Paginated<UserResponse>>, ApiError> {
    let users = list_users(&state.db, &query).await?;
    Ok(Json(users.map(UserResponse::from)))
}

/// GET /api/admin/users/:id
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    find_user_by_id(&state.db, &id)
        .await?
        .map(|u| Json(UserResponse::from(u)))
        .ok_or_else(|| ApiError::not_found("User not found"))
}

/// PUT /api/admin/users/:id
pub async fn update(
    State(state): State<Arc<AppState>>,
    admin: User,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut request): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    if let Some(name) = request.name.as_mut() {
        *name = name.trim().to_string();
        let mut errors = ValidationErrorBuilder::new();
        errors.check("name", validate_name(name));
        errors.finish()?;
    }

    // An admin locking themselves out leaves nobody to undo it
    if id == admin.id && (request.is_active == Some(false) || request.role.is_some_and(|r| r != admin.role)) {
        return Err(ApiError::bad_request("Admins cannot demote or deactivate themselves"));
    }

    let user = update_user(&state.db, &id, &request)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    if !user.is_active {
        let revoked = delete_user_sessions(&state.db, &user.id).await?;
        tracing::info!(user_id = %user.id, revoked = revoked, "Sessions revoked for deactivated user");
    }

    let details = serde_json::json!({
        "name": request.name,
        "role": request.role,
        "is_active": request.is_active,
    });
    audit_log(
        &state,
        AuditEntry {
            action: actions::USER_UPDATE,
            resource_type: resource_types::USER,
            resource_id: Some(&user.id),
            user_id: Some(&admin.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: Some(details),
        },
    )
    .await;

    Ok(Json(UserResponse::from(user)))
}

/// POST /api/admin/users/:id/credits - signed adjustment
pub async fn adjust_credits(
    State(state): State<Arc<AppState>>,
    admin: User,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<AdjustCreditsRequest>,
) -> Result<Json<CreditTransaction>, ApiError> {
    if request.amount == 0 {
        return Err(ApiError::validation_field("amount", "Amount must not be zero"));
    }

    let row = ledger::adjust(
        &state.db,
        &id,
        request.amount,
        request.description.as_deref(),
        &admin.id,
    )
    .await?;

    if request.amount > 0 {
        super::metrics::record_credits_added(row.transaction_type, request.amount);
    }

    let details = serde_json::json!({
        "amount": request.amount,
        "balance_after": row.balance_after,
        "description": request.description,
    });
    audit_log(
        &state,
        AuditEntry {
            action: actions::CREDITS_ADJUST,
            resource_type: resource_types::USER,
            resource_id: Some(&id),
            user_id: Some(&admin.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: Some(details),
        },
    )
    .await;

    Ok(Json(row))
}

/// GET /api/admin/users/:id/transactions
pub async fn transactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Paginated<CreditTransaction>>, ApiError> {
    if find_user_by_id(&state.db, &id).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }
    Ok(Json(list_user_transactions(&state.db, &id, &page).await?))
}
