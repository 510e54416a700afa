//! Credit ledger rows.
//!
//! Rows are append-only. Balance mutations go through [`crate::ledger`],
//! which writes the row and the `users.credits` update in one transaction.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use super::common::{PageQuery, Paginated};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits bought through an approved payment request
    Purchase,
    /// Free credits, e.g. on signup
    Bonus,
    /// Consumed by a successful description
    Usage,
    /// Manual correction by an admin, either sign
    AdminAdjustment,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Purchase => write!(f, "purchase"),
            TransactionType::Bonus => write!(f, "bonus"),
            TransactionType::Usage => write!(f, "usage"),
            TransactionType::AdminAdjustment => write!(f, "admin_adjustment"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    /// Signed: negative for usage
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub balance_after: i64,
    /// Payment request or admin that caused the row
    pub reference_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub credits: i64,
}

/// Admin credit adjustment
#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    pub amount: i64,
    pub description: Option<String>,
}

/// A user whose cached balance disagrees with the ledger
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct LedgerMismatch {
    pub user_id: String,
    pub email: String,
    pub credits: i64,
    pub ledger_sum: i64,
}

pub async fn list_user_transactions(
    db: &SqlitePool,
    user_id: &str,
    page: &PageQuery,
) -> Result<Paginated<CreditTransaction>, sqlx::Error> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credit_transactions WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(db)
        .await?;

    let items = sqlx::query_as::<_, CreditTransaction>(
        "SELECT * FROM credit_transactions WHERE user_id = ?
         ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(db)
    .await?;

    Ok(Paginated::new(items, total, page))
}

/// Users where `credits != SUM(amount)`. Empty when the ledger is consistent.
pub async fn find_ledger_mismatches(db: &SqlitePool) -> Result<Vec<LedgerMismatch>, sqlx::Error> {
    sqlx::query_as::<_, LedgerMismatch>(
        "SELECT u.id AS user_id, u.email, u.credits, COALESCE(SUM(t.amount), 0) AS ledger_sum
         FROM users u
         LEFT JOIN credit_transactions t ON t.user_id = u.id
         GROUP BY u.id
         HAVING u.credits != COALESCE(SUM(t.amount), 0)
         ORDER BY u.email",
    )
    .fetch_all(db)
    .await
}
