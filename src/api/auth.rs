use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::audit::{audit_log, extract_client_ip};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_name, validate_password};
use crate::config::Config;
use crate::db::{
    actions, create_session, delete_session, find_session_user, find_user_by_email, insert_user,
    resource_types, set_password_hash, update_user, AuditEntry, LoginRequest, LoginResponse,
    NewUser, RegisterRequest, TransactionType, UpdateUserRequest, User, UserResponse, UserRole,
};
use crate::ledger::Ledger;
use crate::AppState;

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Generate a random session token
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// Hash a token for storage
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Bearer token from the Authorization header, else the session cookie
fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(auth_header) = headers.get("Authorization").and_then(|h| h.to_str().ok()) {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    CookieJar::from_headers(headers)
        .get(cookie_name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

fn session_cookie(config: &Config, token: String) -> Cookie<'static> {
    Cookie::build((config.auth.cookie_name.clone(), token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config.auth.secure_cookies)
        .build()
}

async fn start_session(state: &AppState, user: &User) -> Result<String, ApiError> {
    let token = generate_token();
    let expires_at = (chrono::Utc::now() + chrono::Duration::hours(state.config.auth.session_ttl_hours))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    create_session(&state.db, &user.id, &hash_token(&token), &expires_at).await?;
    Ok(token)
}

/// POST /api/auth/register - create a user and grant the signup bonus
pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, CookieJar, Json<LoginResponse>), ApiError> {
    let email = request.email.trim().to_lowercase();
    let name = request.name.trim().to_string();

    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(&email))
        .check("password", validate_password(&request.password))
        .check("name", validate_name(&name));
    errors.finish()?;

    if find_user_by_email(&state.db, &email).await?.is_some() {
        return Err(ApiError::conflict("An account with this email already exists"));
    }

    let password_hash = hash_password(&request.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;

    let bonus = state.config.credits.signup_bonus;
    let mut tx = state.db.begin().await?;
    let mut user = insert_user(
        &mut tx,
        &NewUser {
            email: &email,
            password_hash: &password_hash,
            name: &name,
            role: UserRole::User,
        },
    )
    .await?;
    if bonus > 0 {
        let row = Ledger::new(&mut tx)
            .add(&user.id, bonus, TransactionType::Bonus, Some("Signup bonus"), None)
            .await?;
        user.credits = row.balance_after;
    }
    tx.commit().await?;

    if bonus > 0 {
        super::metrics::record_credits_added(TransactionType::Bonus, bonus);
    }
    tracing::info!(user_id = %user.id, email = %user.email, bonus = bonus, "User registered");

    audit_log(
        &state,
        AuditEntry {
            action: actions::AUTH_REGISTER,
            resource_type: resource_types::USER,
            resource_id: Some(&user.id),
            user_id: Some(&user.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: None,
        },
    )
    .await;

    let token = start_session(&state, &user).await?;
    let jar = jar.add(session_cookie(&state.config, token.clone()));

    Ok((
        StatusCode::CREATED,
        jar,
        Json(LoginResponse {
            token,
            user: UserResponse::from(user),
        }),
    ))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let user = find_user_by_email(&state.db, request.email.trim())
        .await?
        .filter(|u| verify_password(&request.password, &u.password_hash))
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    if !user.is_active {
        return Err(ApiError::forbidden("Account is disabled"));
    }

    let token = start_session(&state, &user).await?;

    audit_log(
        &state,
        AuditEntry {
            action: actions::AUTH_LOGIN,
            resource_type: resource_types::USER,
            resource_id: Some(&user.id),
            user_id: Some(&user.id),
            ip_address: extract_client_ip(&headers).as_deref(),
            details: None,
        },
    )
    .await;

    let jar = jar.add(session_cookie(&state.config, token.clone()));
    Ok((
        jar,
        Json(LoginResponse {
            token,
            user: UserResponse::from(user),
        }),
    ))
}

/// POST /api/auth/logout - end the presented session
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), ApiError> {
    let cookie_name = state.config.auth.cookie_name.clone();
    if let Some(token) = extract_token(&headers, &cookie_name) {
        delete_session(&state.db, &hash_token(&token)).await?;
    }
    Ok((jar.remove(Cookie::build((cookie_name, "")).path("/")), StatusCode::NO_CONTENT))
}

/// GET /api/auth/me
pub async fn me(user: User) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

/// Resolve the session and stash the [`User`] in request extensions
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers(), &state.config.auth.cookie_name)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    let user = find_session_user(&state.db, &hash_token(&token))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

    if !user.is_active {
        return Err(ApiError::forbidden("Account is disabled"));
    }

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

/// Must run after [`auth_middleware`]
pub async fn admin_middleware(request: Request<Body>, next: Next) -> Response {
    match request.extensions().get::<User>() {
        Some(user) if user.is_admin() => next.run(request).await,
        Some(_) => ApiError::forbidden("Admin access required").into_response(),
        None => ApiError::unauthorized("Authentication required").into_response(),
    }
}

/// Extractor for the user resolved by [`auth_middleware`]
#[async_trait]
impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<User>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))
    }
}

/// Make sure the configured bootstrap admin exists, is active and has the
/// configured password. Does nothing when no admin password is configured.
pub async fn ensure_admin(db: &sqlx::SqlitePool, config: &Config) -> anyhow::Result<()> {
    let Some(password) = config.auth.admin_password.as_deref() else {
        tracing::debug!("No admin password configured, skipping bootstrap admin");
        return Ok(());
    };
    let email = config.auth.admin_email.trim().to_lowercase();

    match find_user_by_email(db, &email).await? {
        Some(existing) => {
            if !existing.is_admin() || !existing.is_active {
                update_user(
                    db,
                    &existing.id,
                    &UpdateUserRequest {
                        role: Some(UserRole::Admin),
                        is_active: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            }
            if !verify_password(password, &existing.password_hash) {
                let hash = hash_password(password)
                    .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;
                set_password_hash(db, &existing.id, &hash).await?;
                tracing::info!(email = %email, "Bootstrap admin password updated");
            }
        }
        None => {
            let hash = hash_password(password)
                .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;
            let mut conn = db.acquire().await?;
            insert_user(
                &mut conn,
                &NewUser {
                    email: &email,
                    password_hash: &hash,
                    name: "Administrator",
                    role: UserRole::Admin,
                },
            )
            .await?;
            tracing::info!(email = %email, "Bootstrap admin created");
        }
    }

    Ok(())
}
