//! Admin CRUD over runtime settings. Secret values never leave the server
//! unmasked.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use super::audit::{audit_log, extract_client_ip};
use super::error::ApiError;
use super::validation::validate_setting_key;
use crate::crypto;
use crate::db::{
    actions, delete_setting, list_settings, resource_types, upsert_setting, AuditEntry, Setting,
    SettingResponse, UpsertSettingRequest, User,
};
use crate::AppState;

fn to_response(setting: Setting, state: &AppState) -> SettingResponse {
    if !setting.is_secret() {
        return SettingResponse::from_setting(setting, None);
    }
    // Mask the plaintext tail; a value that cannot be opened is masked as stored
    let plaintext = crypto::decrypt_if_encrypted(&setting.value, state.encryption_key.as_ref()).ok();
    SettingResponse::from_setting(setting, plaintext.as_deref())
}

/// GET /api/admin/settings
pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SettingResponse>>, ApiError> {
    let settings = list_settings(&state.db).await?;
    Ok(Json(
        settings
            .into_iter()
            .map(|s| to_response(s, &state))
            .collect(),
    ))
}

/// PUT /api/admin/settings/:key
pub async fn upsert(
    State(state): State<Arc<AppState>>,
    admin: User,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(request): Json<UpsertSettingRequest>,
) -> Result<Json<SettingResponse>, ApiError> {
    validate_setting_key(&key).map_err(|e| ApiError::validation_field("key", e))?;

    let setting = upsert_setting(&state.db, &key, &request, state.encryption_key.as_ref()).await?;
    if setting.is_secret() && state.encryption_key.is_none() {
        tracing::warn!(key = %key, "Secret setting stored unencrypted, auth.encryption_key is not set");
    }
    tracing::info!(key = %key, category = %setting.category, "Setting updated");

    let details = serde_json::json!({
        "category": setting.category,
        "is_active": setting.is_active,
    });
    audit_log(
        &state,
        AuditEntry {
            action: actions::SETTING_UPSERT,
            resource_type: resource_types::SETTING,
            resource_id: Some(&key),
            user_id: Some(&admin.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: Some(details),
        },
    )
    .await;

    Ok(Json(to_response(setting, &state)))
}

/// DELETE /api/admin/settings/:key
pub async fn remove(
    State(state): State<Arc<AppState>>,
    admin: User,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !delete_setting(&state.db, &key).await? {
        return Err(ApiError::not_found("Setting not found"));
    }

    audit_log(
        &state,
        AuditEntry {
            action: actions::SETTING_DELETE,
            resource_type: resource_types::SETTING,
            resource_id: Some(&key),
            user_id: Some(&admin.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: None,
        },
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}
