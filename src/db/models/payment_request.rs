//! Manual payment requests awaiting admin approval.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor, SqlitePool};

use super::common::{PageQuery, Paginated};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Approved => write!(f, "approved"),
            PaymentStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct PaymentRequest {
    pub id: String,
    pub user_id: String,
    pub credits_requested: i64,
    pub amount: f64,
    pub status: PaymentStatus,
    pub payment_method: Option<String>,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub processed_by: Option<String>,
    pub processed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentRequest {
    pub credits_requested: i64,
    pub amount: f64,
    pub payment_method: Option<String>,
    pub reference: Option<String>,
}

/// Body of approve/reject calls
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessPaymentRequest {
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentListQuery {
    pub status: Option<PaymentStatus>,
    pub user_id: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

pub async fn insert_payment_request(
    db: &SqlitePool,
    user_id: &str,
    request: &CreatePaymentRequest,
) -> Result<PaymentRequest, sqlx::Error> {
    let record = PaymentRequest {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        credits_requested: request.credits_requested,
        amount: request.amount,
        status: PaymentStatus::Pending,
        payment_method: request.payment_method.clone(),
        reference: request.reference.clone(),
        notes: None,
        processed_by: None,
        processed_at: None,
        created_at: crate::db::now(),
    };

    sqlx::query(
        "INSERT INTO payment_requests
            (id, user_id, credits_requested, amount, status, payment_method, reference, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(record.credits_requested)
    .bind(record.amount)
    .bind(record.status)
    .bind(&record.payment_method)
    .bind(&record.reference)
    .bind(&record.created_at)
    .execute(db)
    .await?;

    Ok(record)
}

pub async fn find_payment_request<'e>(
    db: impl SqliteExecutor<'e>,
    id: &str,
) -> Result<Option<PaymentRequest>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRequest>("SELECT * FROM payment_requests WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

/// Move a pending request into a terminal state.
///
/// Returns `false` when the request is missing or already processed; the
/// `status = 'pending'` guard makes the transition happen at most once.
pub async fn finalize_payment_request(
    conn: &mut SqliteConnection,
    id: &str,
    status: PaymentStatus,
    processed_by: &str,
    notes: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment_requests
         SET status = ?, processed_by = ?, processed_at = ?, notes = COALESCE(?, notes)
         WHERE id = ? AND status = 'pending'",
    )
    .bind(status)
    .bind(processed_by)
    .bind(crate::db::now())
    .bind(notes)
    .bind(id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn list_payment_requests(
    db: &SqlitePool,
    query: &PaymentListQuery,
) -> Result<Paginated<PaymentRequest>, sqlx::Error> {
    let page = PageQuery {
        page: query.page,
        per_page: query.per_page,
    };

    let mut conditions = Vec::new();
    let mut bindings: Vec<String> = Vec::new();

    if let Some(status) = query.status {
        conditions.push("status = ?");
        bindings.push(status.to_string());
    }
    if let Some(user_id) = &query.user_id {
        conditions.push("user_id = ?");
        bindings.push(user_id.clone());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM payment_requests {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for binding in &bindings {
        count_query = count_query.bind(binding);
    }
    let total = count_query.fetch_one(db).await?;

    let sql = format!(
        "SELECT * FROM payment_requests {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query_as::<_, PaymentRequest>(&sql);
    for binding in &bindings {
        list_query = list_query.bind(binding);
    }
    let items = list_query
        .bind(page.per_page())
        .bind(page.offset())
        .fetch_all(db)
        .await?;

    Ok(Paginated::new(items, total, &page))
}
