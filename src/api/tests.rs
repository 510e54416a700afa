use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;

use super::auth::hash_token;
use super::create_router;
use crate::config::Config;
use crate::db::{create_session, init_memory, DbPool, LoginResponse, User, UserRole};
use crate::ledger;
use crate::test_utils::{create_user_with_role, png_bytes, ScriptedProvider};
use crate::AppState;

struct TestApp {
    server: TestServer,
    db: DbPool,
    provider: Arc<ScriptedProvider>,
}

async fn test_app() -> TestApp {
    test_app_with(ScriptedProvider::always_ok()).await
}

async fn test_app_with(provider: ScriptedProvider) -> TestApp {
    let db = init_memory().await.unwrap();
    let mut config = Config::default();
    config.rate_limit.enabled = false;

    let provider = Arc::new(provider);
    let state = Arc::new(AppState::new(config, db.clone(), provider.clone()));
    let server = TestServer::new(create_router(state)).unwrap();
    TestApp { server, db, provider }
}

fn auth_header(token: &str) -> (HeaderName, HeaderValue) {
    (
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    )
}

/// Open a session for an existing user without going through login
async fn session_for(db: &DbPool, user: &User) -> String {
    let token = format!("test-token-{}", user.id);
    create_session(db, &user.id, &hash_token(&token), "2999-01-01T00:00:00Z")
        .await
        .unwrap();
    token
}

async fn register(app: &TestApp, email: &str) -> LoginResponse {
    let response = app
        .server
        .post("/api/auth/register")
        .json(&json!({ "email": email, "password": "correct4horse", "name": "Ada" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json::<LoginResponse>()
}

async fn admin_token(app: &TestApp) -> String {
    let admin = create_user_with_role(&app.db, "root@example.com", 0, UserRole::Admin).await;
    session_for(&app.db, &admin).await
}

fn png_form(field: &str, names: &[&str]) -> MultipartForm {
    names.iter().fold(MultipartForm::new(), |form, name| {
        form.add_part(
            field,
            Part::bytes(png_bytes()).file_name(*name).mime_type("image/png"),
        )
    })
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let response = app.server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "OK");
}

#[tokio::test]
async fn test_register_grants_bonus_and_opens_session() {
    let app = test_app().await;
    let login = register(&app, "Ada@Example.com").await;
    assert_eq!(login.user.email, "ada@example.com");
    assert_eq!(login.user.credits, 5);

    let (name, value) = auth_header(&login.token);
    let me = app.server.get("/api/auth/me").add_header(name, value).await;
    assert_eq!(me.status_code(), StatusCode::OK);
    assert_eq!(me.json::<Value>()["email"], "ada@example.com");

    let duplicate = app
        .server
        .post("/api/auth/register")
        .json(&json!({ "email": "ada@example.com", "password": "correct4horse", "name": "Ada" }))
        .await;
    assert_eq!(duplicate.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_register_validation_errors() {
    let app = test_app().await;
    let response = app
        .server
        .post("/api/auth/register")
        .json(&json!({ "email": "nope", "password": "short", "name": "" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let body = response.json::<Value>();
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_login_and_logout() {
    let app = test_app().await;
    register(&app, "grace@example.com").await;

    let bad = app
        .server
        .post("/api/auth/login")
        .json(&json!({ "email": "grace@example.com", "password": "wrong4horse" }))
        .await;
    assert_eq!(bad.status_code(), StatusCode::UNAUTHORIZED);

    let good = app
        .server
        .post("/api/auth/login")
        .json(&json!({ "email": "GRACE@example.com", "password": "correct4horse" }))
        .await;
    assert_eq!(good.status_code(), StatusCode::OK);
    let token = good.json::<LoginResponse>().token;

    let (name, value) = auth_header(&token);
    let logout = app.server.post("/api/auth/logout").add_header(name, value).await;
    assert_eq!(logout.status_code(), StatusCode::NO_CONTENT);

    let (name, value) = auth_header(&token);
    let me = app.server.get("/api/auth/me").add_header(name, value).await;
    assert_eq!(me.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_inactive_user_cannot_log_in() {
    let app = test_app().await;
    let login = register(&app, "gone@example.com").await;
    sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
        .bind(&login.user.id)
        .execute(&app.db)
        .await
        .unwrap();

    let response = app
        .server
        .post("/api/auth/login")
        .json(&json!({ "email": "gone@example.com", "password": "correct4horse" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_protected_routes_require_session_and_role() {
    let app = test_app().await;
    assert_eq!(
        app.server.get("/api/credits").await.status_code(),
        StatusCode::UNAUTHORIZED
    );

    let login = register(&app, "user@example.com").await;
    let (name, value) = auth_header(&login.token);
    let stats = app.server.get("/api/admin/stats").add_header(name, value).await;
    assert_eq!(stats.status_code(), StatusCode::FORBIDDEN);

    let admin = admin_token(&app).await;
    let (name, value) = auth_header(&admin);
    let stats = app.server.get("/api/admin/stats").add_header(name, value).await;
    assert_eq!(stats.status_code(), StatusCode::OK);
    assert_eq!(stats.json::<Value>()["total_users"], 2);
}

#[tokio::test]
async fn test_describe_single_charges_one_credit() {
    let app = test_app().await;
    let login = register(&app, "single@example.com").await;

    let (name, value) = auth_header(&login.token);
    let response = app
        .server
        .post("/api/describe")
        .add_header(name, value)
        .multipart(png_form("file", &["cat.png"]))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body = response.json::<Value>();
    assert_eq!(body["credits_remaining"], 4);
    assert_eq!(body["description"]["description"], "Description of cat.png");
    assert_eq!(body["description"]["source"], "ideogram");

    let (name, value) = auth_header(&login.token);
    let list = app.server.get("/api/descriptions").add_header(name, value).await;
    assert_eq!(list.json::<Value>()["total"], 1);
}

#[tokio::test]
async fn test_describe_rejects_unsupported_type() {
    let app = test_app().await;
    let login = register(&app, "text@example.com").await;

    let form = MultipartForm::new().add_part(
        "file",
        Part::bytes(b"hello world".to_vec())
            .file_name("notes.txt")
            .mime_type("text/plain"),
    );
    let (name, value) = auth_header(&login.token);
    let response = app
        .server
        .post("/api/describe")
        .add_header(name, value)
        .multipart(form)
        .await;

    assert_eq!(response.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(app.provider.calls(), 0);
    assert_eq!(ledger::balance(&app.db, &login.user.id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_batch_rejected_up_front_without_credits() {
    let app = test_app().await;
    let login = register(&app, "poor@example.com").await;

    let (name, value) = auth_header(&login.token);
    let response = app
        .server
        .post("/api/describe/batch")
        .add_header(name, value)
        .multipart(png_form("files", &["1.png", "2.png", "3.png", "4.png", "5.png", "6.png"]))
        .await;

    assert_eq!(response.status_code(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(response.json::<Value>()["error"]["code"], "insufficient_credits");
    assert_eq!(app.provider.calls(), 0);
}

#[tokio::test]
async fn test_upload_file_count_is_capped() {
    let app = test_app().await;
    let login = register(&app, "many@example.com").await;

    let names: Vec<String> = (0..51).map(|i| format!("{}.png", i)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let (name, value) = auth_header(&login.token);
    let batch = app
        .server
        .post("/api/describe/batch")
        .add_header(name, value)
        .multipart(png_form("files", &names))
        .await;
    assert_eq!(batch.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        batch.json::<Value>()["error"]["message"],
        "At most 50 file(s) may be uploaded per request"
    );

    let (name, value) = auth_header(&login.token);
    let single = app
        .server
        .post("/api/describe")
        .add_header(name, value)
        .multipart(png_form("file", &["a.png", "b.png"]))
        .await;
    assert_eq!(single.status_code(), StatusCode::BAD_REQUEST);

    assert_eq!(app.provider.calls(), 0);
    assert_eq!(ledger::balance(&app.db, &login.user.id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_batch_streams_events() {
    let app = test_app_with(ScriptedProvider::failing_on(&["b.png"])).await;
    let login = register(&app, "batch@example.com").await;

    let (name, value) = auth_header(&login.token);
    let response = app
        .server
        .post("/api/describe/batch?mode=concurrent")
        .add_header(name, value)
        .multipart(png_form("files", &["a.png", "b.png", "c.png"]))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let payloads: Vec<Value> = response
        .text()
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();

    let results: Vec<&Value> = payloads.iter().filter(|p| p["type"] == "result").collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|r| r["success"] == true).count(), 2);

    let complete = payloads.last().unwrap();
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["succeeded"], 2);
    assert_eq!(complete["failed"], 1);
    assert_eq!(complete["credits_used"], 2);
    assert_eq!(complete["credits_remaining"], 3);

    assert_eq!(ledger::balance(&app.db, &login.user.id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_batch_rejects_unknown_mode() {
    let app = test_app().await;
    let login = register(&app, "mode@example.com").await;

    let (name, value) = auth_header(&login.token);
    let response = app
        .server
        .post("/api/describe/batch?mode=turbo")
        .add_header(name, value)
        .multipart(png_form("files", &["a.png"]))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payment_request_approved_once() {
    let app = test_app().await;
    let login = register(&app, "buyer@example.com").await;
    let admin = admin_token(&app).await;

    let (name, value) = auth_header(&login.token);
    let created = app
        .server
        .post("/api/payments")
        .add_header(name, value)
        .json(&json!({ "credits_requested": 100, "amount": 10.0, "payment_method": "bank" }))
        .await;
    assert_eq!(created.status_code(), StatusCode::CREATED);
    let id = created.json::<Value>()["id"].as_str().unwrap().to_string();

    let (name, value) = auth_header(&admin);
    let approved = app
        .server
        .post(&format!("/api/admin/payments/{}/approve", id))
        .add_header(name, value)
        .await;
    assert_eq!(approved.status_code(), StatusCode::OK);
    assert_eq!(approved.json::<Value>()["status"], "approved");

    let (name, value) = auth_header(&admin);
    let again = app
        .server
        .post(&format!("/api/admin/payments/{}/reject", id))
        .add_header(name, value)
        .json(&json!({ "notes": "too late" }))
        .await;
    assert_eq!(again.status_code(), StatusCode::CONFLICT);

    let (name, value) = auth_header(&login.token);
    let balance = app.server.get("/api/credits").add_header(name, value).await;
    assert_eq!(balance.json::<Value>()["credits"], 105);
}

#[tokio::test]
async fn test_payment_request_validation() {
    let app = test_app().await;
    let login = register(&app, "cheap@example.com").await;

    let (name, value) = auth_header(&login.token);
    let response = app
        .server
        .post("/api/payments")
        .add_header(name, value)
        .json(&json!({ "credits_requested": 0, "amount": 10.0 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let (name, value) = auth_header(&login.token);
    let huge = app
        .server
        .post("/api/payments")
        .add_header(name, value)
        .json(&json!({ "credits_requested": i64::MAX, "amount": 10.0 }))
        .await;
    assert_eq!(huge.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_adjustment_cannot_overdraw() {
    let app = test_app().await;
    let login = register(&app, "adjust@example.com").await;
    let admin = admin_token(&app).await;
    let path = format!("/api/admin/users/{}/credits", login.user.id);

    let (name, value) = auth_header(&admin);
    let add = app
        .server
        .post(&path)
        .add_header(name, value)
        .json(&json!({ "amount": 10, "description": "goodwill" }))
        .await;
    assert_eq!(add.status_code(), StatusCode::OK);
    assert_eq!(add.json::<Value>()["balance_after"], 15);

    let (name, value) = auth_header(&admin);
    let overdraw = app
        .server
        .post(&path)
        .add_header(name, value)
        .json(&json!({ "amount": -50 }))
        .await;
    assert_eq!(overdraw.status_code(), StatusCode::PAYMENT_REQUIRED);

    for amount in [i64::MIN, i64::MAX] {
        let (name, value) = auth_header(&admin);
        let extreme = app
            .server
            .post(&path)
            .add_header(name, value)
            .json(&json!({ "amount": amount }))
            .await;
        assert_eq!(extreme.status_code(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(ledger::balance(&app.db, &login.user.id).await.unwrap(), 15);

    let (name, value) = auth_header(&admin);
    let reconcile = app
        .server
        .get("/api/admin/ledger/reconcile")
        .add_header(name, value)
        .await;
    assert_eq!(reconcile.json::<Value>()["consistent"], true);
}

#[tokio::test]
async fn test_secret_settings_are_masked() {
    let app = test_app().await;
    let admin = admin_token(&app).await;

    let (name, value) = auth_header(&admin);
    let saved = app
        .server
        .put("/api/admin/settings/IDEOGRAM_API_KEY")
        .add_header(name, value)
        .json(&json!({ "value": "ideo-secret-value-1234" }))
        .await;
    assert_eq!(saved.status_code(), StatusCode::OK);
    let body = saved.json::<Value>();
    assert_eq!(body["category"], "api_keys");
    assert_ne!(body["value"], "ideo-secret-value-1234");
    assert!(body["value"].as_str().unwrap().ends_with("1234"));

    let (name, value) = auth_header(&admin);
    let bad_key = app
        .server
        .put("/api/admin/settings/lower-case")
        .add_header(name, value)
        .json(&json!({ "value": "x" }))
        .await;
    assert_eq!(bad_key.status_code(), StatusCode::BAD_REQUEST);

    let (name, value) = auth_header(&admin);
    let deleted = app
        .server
        .delete("/api/admin/settings/IDEOGRAM_API_KEY")
        .add_header(name, value)
        .await;
    assert_eq!(deleted.status_code(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_deactivating_user_revokes_sessions() {
    let app = test_app().await;
    let login = register(&app, "revoke@example.com").await;
    let admin = admin_token(&app).await;

    let (name, value) = auth_header(&admin);
    let updated = app
        .server
        .put(&format!("/api/admin/users/{}", login.user.id))
        .add_header(name, value)
        .json(&json!({ "is_active": false }))
        .await;
    assert_eq!(updated.status_code(), StatusCode::OK);

    let (name, value) = auth_header(&login.token);
    let me = app.server.get("/api/auth/me").add_header(name, value).await;
    assert_eq!(me.status_code(), StatusCode::UNAUTHORIZED);
}
