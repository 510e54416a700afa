//! Credit ledger.
//!
//! `users.credits` is a cached balance; `credit_transactions` is the
//! append-only log it must reconcile with. Every mutation updates the balance
//! and appends the matching row on the same connection, so callers that hold
//! a transaction get both writes or neither.
//!
//! [`Ledger`] borrows a connection and can be composed with other writes
//! (a description insert, a payment approval). The free functions open and
//! commit their own transaction.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::db::{CreditTransaction, TransactionType};

/// Largest amount a single ledger operation may move. Keeps balances far
/// from the `i64` range, where SQLite would silently switch to REAL.
pub const MAX_CREDIT_AMOUNT: i64 = 1_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("Credit amount must be between 1 and 1000000000, got {0}")]
    InvalidAmount(i64),

    #[error("Usage transactions can only be created by a deduction")]
    UsageNotAddable,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

pub struct Ledger<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    pub async fn balance(&mut self, user_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT credits FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    /// Debit `amount` credits as usage. Fails without writing if the balance
    /// is below `amount`.
    pub async fn deduct(
        &mut self,
        user_id: &str,
        amount: i64,
        description: Option<&str>,
    ) -> Result<CreditTransaction> {
        check_amount(amount)?;
        self.debit(user_id, amount, TransactionType::Usage, description, None)
            .await
    }

    /// Credit `amount` as a purchase, bonus or admin adjustment.
    pub async fn add(
        &mut self,
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: Option<&str>,
        reference_id: Option<&str>,
    ) -> Result<CreditTransaction> {
        check_amount(amount)?;
        if transaction_type == TransactionType::Usage {
            return Err(LedgerError::UsageNotAddable);
        }

        let result = sqlx::query(
            "UPDATE users SET credits = credits + ?, updated_at = ? WHERE id = ?",
        )
        .bind(amount)
        .bind(crate::db::now())
        .bind(user_id)
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UserNotFound(user_id.to_string()));
        }

        self.append(user_id, amount, transaction_type, description, reference_id)
            .await
    }

    /// Signed admin correction. Negative amounts cannot overdraw the balance.
    pub async fn adjust(
        &mut self,
        user_id: &str,
        amount: i64,
        description: Option<&str>,
        admin_id: &str,
    ) -> Result<CreditTransaction> {
        match amount {
            0 => Err(LedgerError::InvalidAmount(0)),
            a if a > 0 => {
                self.add(
                    user_id,
                    a,
                    TransactionType::AdminAdjustment,
                    description,
                    Some(admin_id),
                )
                .await
            }
            a => {
                let debit = a.checked_neg().ok_or(LedgerError::InvalidAmount(a))?;
                check_amount(debit).map_err(|_| LedgerError::InvalidAmount(a))?;
                self.debit(
                    user_id,
                    debit,
                    TransactionType::AdminAdjustment,
                    description,
                    Some(admin_id),
                )
                .await
            }
        }
    }

    async fn debit(
        &mut self,
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: Option<&str>,
        reference_id: Option<&str>,
    ) -> Result<CreditTransaction> {
        // The balance guard lives in the UPDATE itself so two debits racing on
        // the same user cannot both pass a stale read.
        let result = sqlx::query(
            "UPDATE users SET credits = credits - ?, updated_at = ?
             WHERE id = ? AND credits >= ?",
        )
        .bind(amount)
        .bind(crate::db::now())
        .bind(user_id)
        .bind(amount)
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() == 0 {
            let balance = self.balance(user_id).await?;
            return Err(LedgerError::InsufficientCredits {
                balance,
                required: amount,
            });
        }

        self.append(user_id, -amount, transaction_type, description, reference_id)
            .await
    }

    async fn append(
        &mut self,
        user_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: Option<&str>,
        reference_id: Option<&str>,
    ) -> Result<CreditTransaction> {
        let balance_after = self.balance(user_id).await?;

        let row = CreditTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            transaction_type,
            description: description.map(str::to_string),
            balance_after,
            reference_id: reference_id.map(str::to_string),
            created_at: crate::db::now(),
        };

        sqlx::query(
            "INSERT INTO credit_transactions
                (id, user_id, amount, transaction_type, description, balance_after, reference_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(row.amount)
        .bind(row.transaction_type)
        .bind(&row.description)
        .bind(row.balance_after)
        .bind(&row.reference_id)
        .bind(&row.created_at)
        .execute(&mut *self.conn)
        .await?;

        debug!(
            user_id = %user_id,
            amount = amount,
            transaction_type = %transaction_type,
            balance_after = balance_after,
            "Credit transaction recorded"
        );

        Ok(row)
    }
}

fn check_amount(amount: i64) -> Result<()> {
    if amount <= 0 || amount > MAX_CREDIT_AMOUNT {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

pub async fn balance(db: &SqlitePool, user_id: &str) -> Result<i64> {
    let mut conn = db.acquire().await?;
    Ledger::new(&mut conn).balance(user_id).await
}

pub async fn deduct(
    db: &SqlitePool,
    user_id: &str,
    amount: i64,
    description: Option<&str>,
) -> Result<CreditTransaction> {
    let mut tx = db.begin().await?;
    let row = Ledger::new(&mut tx).deduct(user_id, amount, description).await?;
    tx.commit().await?;
    Ok(row)
}

pub async fn add(
    db: &SqlitePool,
    user_id: &str,
    amount: i64,
    transaction_type: TransactionType,
    description: Option<&str>,
    reference_id: Option<&str>,
) -> Result<CreditTransaction> {
    let mut tx = db.begin().await?;
    let row = Ledger::new(&mut tx)
        .add(user_id, amount, transaction_type, description, reference_id)
        .await?;
    tx.commit().await?;

    info!(
        user_id = %user_id,
        amount = amount,
        transaction_type = %transaction_type,
        "Credits added"
    );
    Ok(row)
}

pub async fn adjust(
    db: &SqlitePool,
    user_id: &str,
    amount: i64,
    description: Option<&str>,
    admin_id: &str,
) -> Result<CreditTransaction> {
    let mut tx = db.begin().await?;
    let row = Ledger::new(&mut tx)
        .adjust(user_id, amount, description, admin_id)
        .await?;
    tx.commit().await?;

    info!(
        user_id = %user_id,
        admin_id = %admin_id,
        amount = amount,
        "Admin credit adjustment"
    );
    Ok(row)
}
