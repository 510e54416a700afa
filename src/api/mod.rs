mod admin;
pub mod audit;
pub mod auth;
mod credits;
mod describe;
pub mod error;
pub mod metrics;
mod payments;
pub mod rate_limit;
mod settings;
mod users;
mod validation;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ErrorCode};

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Account creation and login (public, strict rate limit)
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ));

    // Endpoints that reach the vision provider
    let describe_routes = Router::new()
        .route("/describe", post(describe::describe_single))
        .route("/describe/batch", post(describe::describe_batch))
        .layer(DefaultBodyLimit::max(state.config.max_body_size()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_describe,
        ));

    let user_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/descriptions", get(describe::list_descriptions))
        .route("/descriptions/:id", get(describe::get_description))
        .route("/credits", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/credits/packages", get(credits::list_packages))
        .route(
            "/payments",
            get(payments::list_own_payments).post(payments::create_payment),
        );

    let admin_routes = Router::new()
        // Users
        .route("/users", get(users::list))
        .route("/users/:id", get(users::get).put(users::update))
        .route("/users/:id/credits", post(users::adjust_credits))
        .route("/users/:id/transactions", get(users::transactions))
        // Payments
        .route("/payments", get(payments::list_all_payments))
        .route("/payments/:id/approve", post(payments::approve_payment))
        .route("/payments/:id/reject", post(payments::reject_payment))
        // Settings
        .route("/settings", get(settings::list))
        .route(
            "/settings/:key",
            put(settings::upsert).delete(settings::remove),
        )
        // Reporting
        .route("/stats", get(admin::stats))
        .route("/ledger/reconcile", get(admin::reconcile))
        .route("/audit", get(audit::list_logs))
        .layer(middleware::from_fn(auth::admin_middleware));

    // Everything below requires a session; auth runs before the admin check
    let protected_routes = Router::new()
        .merge(user_routes)
        .nest("/admin", admin_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ))
        .merge(describe_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let api_routes = Router::new().merge(public_routes).merge(protected_routes);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", api_routes)
        .route_layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(cors_layer(&state.config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(60 * 60))
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests;
