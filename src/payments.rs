//! Admin decisions on manual payment requests.
//!
//! A request leaves `pending` exactly once. Approval stamps the request and
//! credits the user inside one transaction, so a crash between the two writes
//! leaves neither.

use sqlx::SqlitePool;
use tracing::info;

use crate::api::metrics::record_credits_added;
use crate::db::{finalize_payment_request, find_payment_request, PaymentRequest, PaymentStatus, TransactionType};
use crate::ledger::{Ledger, LedgerError};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment request not found")]
    NotFound,

    #[error("Payment request is already {0}")]
    AlreadyProcessed(PaymentStatus),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub async fn approve(
    db: &SqlitePool,
    request_id: &str,
    admin_id: &str,
    notes: Option<&str>,
) -> Result<PaymentRequest, PaymentError> {
    decide(db, request_id, admin_id, PaymentStatus::Approved, notes).await
}

pub async fn reject(
    db: &SqlitePool,
    request_id: &str,
    admin_id: &str,
    reason: Option<&str>,
) -> Result<PaymentRequest, PaymentError> {
    decide(db, request_id, admin_id, PaymentStatus::Rejected, reason).await
}

async fn decide(
    db: &SqlitePool,
    request_id: &str,
    admin_id: &str,
    status: PaymentStatus,
    notes: Option<&str>,
) -> Result<PaymentRequest, PaymentError> {
    let mut tx = db.begin().await?;

    // Write first: the guarded UPDATE takes the write lock and decides the race
    if !finalize_payment_request(&mut tx, request_id, status, admin_id, notes).await? {
        let existing = find_payment_request(&mut *tx, request_id).await?;
        return match existing {
            Some(request) => Err(PaymentError::AlreadyProcessed(request.status)),
            None => Err(PaymentError::NotFound),
        };
    }

    let request = find_payment_request(&mut *tx, request_id)
        .await?
        .ok_or(PaymentError::NotFound)?;

    if status == PaymentStatus::Approved {
        Ledger::new(&mut tx)
            .add(
                &request.user_id,
                request.credits_requested,
                TransactionType::Purchase,
                Some(&format!("Purchase of {} credits", request.credits_requested)),
                Some(&request.id),
            )
            .await?;
    }

    tx.commit().await?;

    if status == PaymentStatus::Approved {
        record_credits_added(TransactionType::Purchase, request.credits_requested);
    }
    info!(
        request_id = %request.id,
        user_id = %request.user_id,
        admin_id = %admin_id,
        status = %status,
        credits = request.credits_requested,
        "Payment request processed"
    );

    Ok(request)
}
