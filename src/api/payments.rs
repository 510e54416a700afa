//! Payment request endpoints for users and admins.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use super::audit::{audit_log, extract_client_ip};
use super::error::ApiError;
use super::validation::validate_payment_request;
use crate::db::{
    actions, insert_payment_request, list_payment_requests, resource_types, AuditEntry,
    CreatePaymentRequest, PageQuery, Paginated, PaymentListQuery, PaymentRequest,
    ProcessPaymentRequest, User,
};
use crate::payments;
use crate::AppState;

/// POST /api/payments
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentRequest>), ApiError> {
    validate_payment_request(request.credits_requested, request.amount)
        .map_err(ApiError::bad_request)?;

    let payment = insert_payment_request(&state.db, &user.id, &request).await?;
    tracing::info!(
        payment_id = %payment.id,
        user_id = %user.id,
        credits = payment.credits_requested,
        amount = payment.amount,
        "Payment request created"
    );

    let details = serde_json::json!({
        "credits_requested": payment.credits_requested,
        "amount": payment.amount,
    });
    audit_log(
        &state,
        AuditEntry {
            action: actions::PAYMENT_CREATE,
            resource_type: resource_types::PAYMENT_REQUEST,
            resource_id: Some(&payment.id),
            user_id: Some(&user.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: Some(details),
        },
    )
    .await;

    Ok((StatusCode::CREATED, Json(payment)))
}

/// GET /api/payments - the caller's own requests
pub async fn list_own_payments(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(page): Query<PageQuery>,
) -> Result<Json<Paginated<PaymentRequest>>, ApiError> {
    let query = PaymentListQuery {
        status: None,
        user_id: Some(user.id),
        page: page.page,
        per_page: page.per_page,
    };
    Ok(Json(list_payment_requests(&state.db, &query).await?))
}

/// GET /api/admin/payments?status=
pub async fn list_all_payments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PaymentListQuery>,
) -> Result<Json<Paginated<PaymentRequest>>, ApiError> {
    Ok(Json(list_payment_requests(&state.db, &query).await?))
}

/// POST /api/admin/payments/:id/approve
pub async fn approve_payment(
    State(state): State<Arc<AppState>>,
    admin: User,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ProcessPaymentRequest>>,
) -> Result<Json<PaymentRequest>, ApiError> {
    let notes = body.and_then(|Json(b)| b.notes);
    let payment = payments::approve(&state.db, &id, &admin.id, notes.as_deref()).await?;

    let details = serde_json::json!({
        "user_id": payment.user_id,
        "credits": payment.credits_requested,
    });
    audit_log(
        &state,
        AuditEntry {
            action: actions::PAYMENT_APPROVE,
            resource_type: resource_types::PAYMENT_REQUEST,
            resource_id: Some(&payment.id),
            user_id: Some(&admin.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: Some(details),
        },
    )
    .await;

    Ok(Json(payment))
}

/// POST /api/admin/payments/:id/reject
pub async fn reject_payment(
    State(state): State<Arc<AppState>>,
    admin: User,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ProcessPaymentRequest>>,
) -> Result<Json<PaymentRequest>, ApiError> {
    let reason = body.and_then(|Json(b)| b.notes);
    let payment = payments::reject(&state.db, &id, &admin.id, reason.as_deref()).await?;

    audit_log(
        &state,
        AuditEntry {
            action: actions::PAYMENT_REJECT,
            resource_type: resource_types::PAYMENT_REQUEST,
            resource_id: Some(&payment.id),
            user_id: Some(&admin.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: reason.map(|r| serde_json::json!({ "reason": r })),
        },
    )
    .await;

    Ok(Json(payment))
}
