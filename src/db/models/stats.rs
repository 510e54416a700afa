//! Service-wide totals for the admin dashboard.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub total_users: i64,
    pub active_users: i64,
    pub total_descriptions: i64,
    pub fallback_descriptions: i64,
    /// Sum of every user's balance
    pub credits_outstanding: i64,
    /// Credits ever consumed by descriptions
    pub credits_consumed: i64,
    /// Credits ever granted through approved payments
    pub credits_purchased: i64,
    pub pending_payments: i64,
}

pub async fn fetch_system_stats(db: &SqlitePool) -> Result<SystemStats, sqlx::Error> {
    let (total_users, active_users, credits_outstanding): (i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(is_active), 0), COALESCE(SUM(credits), 0) FROM users",
    )
    .fetch_one(db)
    .await?;

    let (total_descriptions, fallback_descriptions): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN source = 'fallback' THEN 1 ELSE 0 END), 0)
         FROM image_descriptions",
    )
    .fetch_one(db)
    .await?;

    let (credits_consumed, credits_purchased): (i64, i64) = sqlx::query_as(
        "SELECT
            COALESCE(SUM(CASE WHEN transaction_type = 'usage' THEN -amount ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN transaction_type = 'purchase' THEN amount ELSE 0 END), 0)
         FROM credit_transactions",
    )
    .fetch_one(db)
    .await?;

    let pending_payments: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM payment_requests WHERE status = 'pending'")
            .fetch_one(db)
            .await?;

    Ok(SystemStats {
        total_users,
        active_users,
        total_descriptions,
        fallback_descriptions,
        credits_outstanding,
        credits_consumed,
        credits_purchased,
        pending_payments,
    })
}
