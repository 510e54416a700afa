//! Audit trail of administrative actions.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogListResponse {
    pub items: Vec<AuditLog>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditLogQuery {
    /// Filter by action (e.g., "payment.approve")
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Filter by acting user
    pub user_id: Option<String>,
    /// Inclusive lower bound (ISO 8601)
    pub start_date: Option<String>,
    /// Inclusive upper bound (ISO 8601)
    pub end_date: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

pub mod actions {
    pub const AUTH_REGISTER: &str = "auth.register";
    pub const AUTH_LOGIN: &str = "auth.login";

    pub const USER_UPDATE: &str = "user.update";
    pub const CREDITS_ADJUST: &str = "credits.adjust";

    pub const PAYMENT_CREATE: &str = "payment.create";
    pub const PAYMENT_APPROVE: &str = "payment.approve";
    pub const PAYMENT_REJECT: &str = "payment.reject";

    pub const SETTING_UPSERT: &str = "setting.upsert";
    pub const SETTING_DELETE: &str = "setting.delete";
}

pub mod resource_types {
    pub const USER: &str = "user";
    pub const PAYMENT_REQUEST: &str = "payment_request";
    pub const SETTING: &str = "setting";
}

/// One audit entry. `details` is stored as JSON text.
#[derive(Debug, Clone, Default)]
pub struct AuditEntry<'a> {
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub ip_address: Option<&'a str>,
    pub details: Option<serde_json::Value>,
}

pub async fn log_audit(db: &SqlitePool, entry: AuditEntry<'_>) -> Result<(), sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let details_json = entry.details.map(|d| d.to_string());

    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, action, resource_type, resource_id, user_id, ip_address, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(entry.action)
    .bind(entry.resource_type)
    .bind(entry.resource_id)
    .bind(entry.user_id)
    .bind(entry.ip_address)
    .bind(&details_json)
    .bind(crate::db::now())
    .execute(db)
    .await?;

    tracing::debug!(
        action = entry.action,
        resource_type = entry.resource_type,
        resource_id = entry.resource_id,
        user_id = entry.user_id,
        "Audit log recorded"
    );

    Ok(())
}

pub async fn list_audit_logs(
    db: &SqlitePool,
    query: &AuditLogQuery,
) -> Result<AuditLogListResponse, sqlx::Error> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(50).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let mut conditions = Vec::new();
    let mut bindings: Vec<String> = Vec::new();

    let filters = [
        ("action = ?", &query.action),
        ("resource_type = ?", &query.resource_type),
        ("resource_id = ?", &query.resource_id),
        ("user_id = ?", &query.user_id),
        ("created_at >= ?", &query.start_date),
        ("created_at <= ?", &query.end_date),
    ];
    for (condition, value) in filters {
        if let Some(value) = value {
            conditions.push(condition);
            bindings.push(value.clone());
        }
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) as count FROM audit_logs {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for binding in &bindings {
        count_query = count_query.bind(binding);
    }
    let total = count_query.fetch_one(db).await?;

    let sql = format!(
        "SELECT * FROM audit_logs {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut query_builder = sqlx::query_as::<_, AuditLog>(&sql);
    for binding in &bindings {
        query_builder = query_builder.bind(binding);
    }
    let items = query_builder.bind(per_page).bind(offset).fetch_all(db).await?;

    Ok(AuditLogListResponse {
        items,
        total,
        page,
        per_page,
        total_pages: (total + per_page - 1) / per_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    #[tokio::test]
    async fn test_log_and_filter() {
        let pool = init_memory().await.unwrap();

        log_audit(
            &pool,
            AuditEntry {
                action: actions::PAYMENT_APPROVE,
                resource_type: resource_types::PAYMENT_REQUEST,
                resource_id: Some("pr-1"),
                user_id: Some("admin-1"),
                details: Some(serde_json::json!({"credits": 50})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        log_audit(
            &pool,
            AuditEntry {
                action: actions::SETTING_UPSERT,
                resource_type: resource_types::SETTING,
                resource_id: Some("IDEOGRAM_API_KEY"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let all = list_audit_logs(&pool, &AuditLogQuery::default()).await.unwrap();
        assert_eq!(all.total, 2);

        let approvals = list_audit_logs(
            &pool,
            &AuditLogQuery {
                action: Some(actions::PAYMENT_APPROVE.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(approvals.total, 1);
        assert_eq!(approvals.items[0].resource_id.as_deref(), Some("pr-1"));
        assert_eq!(approvals.items[0].details.as_deref(), Some(r#"{"credits":50}"#));
    }
}
