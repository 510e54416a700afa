//! Multi-file processing with streamed progress.
//!
//! The orchestrator runs in its own task and reports through an mpsc channel
//! that the SSE handler drains. A closed channel (client went away) does not
//! stop the run; work already paid for is still stored.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::{ProcessError, Processor, UploadedFile};
use crate::api::metrics::{record_batch, record_credits_deducted};
use crate::config::BatchConfig;
use crate::ledger::{self, LedgerError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// One file at a time, charged as it succeeds
    #[default]
    Sequential,
    /// Chunked with a bounded in-flight window, charged once at the end
    Concurrent,
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Sequential => "sequential",
            BatchMode::Concurrent => "concurrent",
        }
    }
}

/// One `data:` payload of the event stream. `index` is the zero-based
/// position of the file in the upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Progress {
        index: usize,
        total: usize,
        filename: String,
    },
    Result {
        index: usize,
        filename: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credits_remaining: Option<i64>,
    },
    Complete {
        total: usize,
        processed: usize,
        succeeded: usize,
        failed: usize,
        credits_used: i64,
        credits_remaining: i64,
        stopped_early: bool,
    },
    Error {
        message: String,
    },
}

impl BatchEvent {
    /// SSE event name; the payload carries the same value in `type`
    pub fn name(&self) -> &'static str {
        match self {
            BatchEvent::Progress { .. } => "progress",
            BatchEvent::Result { .. } => "result",
            BatchEvent::Complete { .. } => "complete",
            BatchEvent::Error { .. } => "error",
        }
    }

    fn success(index: usize, processed: &super::Processed) -> Self {
        BatchEvent::Result {
            index,
            filename: processed.record.filename.clone(),
            success: true,
            description_id: Some(processed.record.id.clone()),
            description: Some(processed.record.description.clone()),
            error: None,
            credits_remaining: processed.credits_remaining,
        }
    }

    fn failure(index: usize, filename: &str, error: &ProcessError) -> Self {
        BatchEvent::Result {
            index,
            filename: filename.to_string(),
            success: false,
            description_id: None,
            description: None,
            error: Some(error.to_string()),
            credits_remaining: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("No files were uploaded")]
    NoFiles,

    #[error("Too many files: {count} uploaded, at most {max} per batch")]
    TooManyFiles { count: usize, max: usize },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Totals of a finished run, mirrored by the `complete` event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub credits_used: i64,
    pub credits_remaining: i64,
    pub stopped_early: bool,
}

impl From<&BatchSummary> for BatchEvent {
    fn from(s: &BatchSummary) -> Self {
        BatchEvent::Complete {
            total: s.total,
            processed: s.processed,
            succeeded: s.succeeded,
            failed: s.failed,
            credits_used: s.credits_used,
            credits_remaining: s.credits_remaining,
            stopped_early: s.stopped_early,
        }
    }
}

pub struct BatchOrchestrator {
    processor: Processor,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(processor: Processor, config: BatchConfig) -> Self {
        Self { processor, config }
    }

    /// Reject the whole batch up front when the balance cannot cover every
    /// file. Nothing reaches the provider in that case.
    pub async fn preflight(&self, user_id: &str, file_count: usize) -> Result<i64, BatchError> {
        if file_count == 0 {
            return Err(BatchError::NoFiles);
        }
        if file_count > self.config.max_files_per_batch {
            return Err(BatchError::TooManyFiles {
                count: file_count,
                max: self.config.max_files_per_batch,
            });
        }

        let required = self.processor.credits_per_image() * file_count as i64;
        let balance = ledger::balance(self.processor.db(), user_id).await?;
        if balance < required {
            return Err(LedgerError::InsufficientCredits { balance, required }.into());
        }
        Ok(balance)
    }

    /// Process every file and finish with a `complete` event, or an `error`
    /// event if the run cannot continue.
    pub async fn run(
        self,
        user_id: String,
        files: Vec<UploadedFile>,
        mode: BatchMode,
        events: mpsc::Sender<BatchEvent>,
    ) -> Option<BatchSummary> {
        record_batch(mode.as_str());
        info!(
            user_id = %user_id,
            files = files.len(),
            mode = mode.as_str(),
            "Batch started"
        );

        let result = match mode {
            BatchMode::Sequential => self.run_sequential(&user_id, &files, &events).await,
            BatchMode::Concurrent => self.run_concurrent(&user_id, &files, &events).await,
        };

        match result {
            Ok(summary) => {
                info!(
                    user_id = %user_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    credits_used = summary.credits_used,
                    stopped_early = summary.stopped_early,
                    "Batch finished"
                );
                emit(&events, BatchEvent::from(&summary)).await;
                Some(summary)
            }
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Batch aborted");
                emit(&events, BatchEvent::Error { message: e.to_string() }).await;
                None
            }
        }
    }

    async fn run_sequential(
        &self,
        user_id: &str,
        files: &[UploadedFile],
        events: &mpsc::Sender<BatchEvent>,
    ) -> Result<BatchSummary, LedgerError> {
        let cost = self.processor.credits_per_image();
        let total = files.len();
        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        let mut balance = ledger::balance(self.processor.db(), user_id).await?;

        for (index, file) in files.iter().enumerate() {
            if balance < cost {
                summary.stopped_early = true;
                warn!(
                    user_id = %user_id,
                    remaining_files = total - index,
                    "Credits exhausted, stopping batch"
                );
                break;
            }

            emit(
                events,
                BatchEvent::Progress {
                    index,
                    total,
                    filename: file.filename.clone(),
                },
            )
            .await;
            summary.processed += 1;

            match self.process_file(user_id, file, true).await {
                Ok(processed) => {
                    summary.succeeded += 1;
                    summary.credits_used += cost;
                    if let Some(remaining) = processed.credits_remaining {
                        balance = remaining;
                    }
                    emit(events, BatchEvent::success(index, &processed)).await;
                }
                Err(ProcessError::Ledger(LedgerError::InsufficientCredits { balance: now, .. })) => {
                    // Spent elsewhere while this file was being described
                    summary.failed += 1;
                    balance = now;
                    let err = ProcessError::Ledger(LedgerError::InsufficientCredits {
                        balance: now,
                        required: cost,
                    });
                    emit(events, BatchEvent::failure(index, &file.filename, &err)).await;
                }
                Err(ProcessError::Database(e)) => return Err(e.into()),
                Err(ProcessError::Ledger(LedgerError::Database(e))) => return Err(e.into()),
                Err(e) => {
                    summary.failed += 1;
                    emit(events, BatchEvent::failure(index, &file.filename, &e)).await;
                }
            }
        }

        summary.credits_remaining = ledger::balance(self.processor.db(), user_id).await?;
        Ok(summary)
    }

    /// Descriptions are stored uncharged as they finish and one aggregate
    /// deduct settles the run. If the balance was spent elsewhere in the
    /// meantime (another concurrent batch from the same preflight balance,
    /// say), the deduct fails and the run ends with an `error` event. The
    /// `result` events already delivered stay stored and are not charged.
    async fn run_concurrent(
        &self,
        user_id: &str,
        files: &[UploadedFile],
        events: &mpsc::Sender<BatchEvent>,
    ) -> Result<BatchSummary, LedgerError> {
        let total = files.len();
        let chunk_size = self.config.batch_size.max(1);
        let window = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut summary = BatchSummary {
            total,
            processed: total,
            ..Default::default()
        };

        for (chunk_index, chunk) in files.chunks(chunk_size).enumerate() {
            debug!(chunk = chunk_index, size = chunk.len(), "Processing chunk");

            let tasks = chunk.iter().enumerate().map(|(offset, file)| {
                let index = chunk_index * chunk_size + offset;
                let window = window.clone();
                async move {
                    // The semaphore is never closed
                    let _permit = window.acquire().await.ok();
                    emit(
                        events,
                        BatchEvent::Progress {
                            index,
                            total,
                            filename: file.filename.clone(),
                        },
                    )
                    .await;

                    let outcome = self.process_file(user_id, file, false).await;
                    let event = match &outcome {
                        Ok(processed) => BatchEvent::success(index, processed),
                        Err(e) => BatchEvent::failure(index, &file.filename, e),
                    };
                    emit(events, event).await;
                    outcome.is_ok()
                }
            });

            let results = join_all(tasks).await;
            let ok = results.iter().filter(|r| **r).count();
            summary.succeeded += ok;
            summary.failed += results.len() - ok;
        }

        let owed = self.processor.credits_per_image() * summary.succeeded as i64;
        if owed > 0 {
            let row = ledger::deduct(
                self.processor.db(),
                user_id,
                owed,
                Some(&format!("Batch of {} images", summary.succeeded)),
            )
            .await?;
            record_credits_deducted(owed);
            summary.credits_used = owed;
            summary.credits_remaining = row.balance_after;
        } else {
            summary.credits_remaining = ledger::balance(self.processor.db(), user_id).await?;
        }

        Ok(summary)
    }

    async fn process_file(
        &self,
        user_id: &str,
        file: &UploadedFile,
        charge: bool,
    ) -> Result<super::Processed, ProcessError> {
        let image = self.processor.validate(file).inspect_err(|e| {
            debug!(filename = %file.filename, error = %e, "Rejected upload");
            crate::api::metrics::record_description_failed();
        })?;
        let description = self.processor.describe(&image).await?;
        self.processor.persist(user_id, &image, &description, charge).await
    }
}

async fn emit(events: &mpsc::Sender<BatchEvent>, event: BatchEvent) {
    if events.send(event).await.is_err() {
        debug!("Event receiver dropped, continuing batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::db::{find_ledger_mismatches, init_memory, list_user_descriptions, TransactionType};
    use crate::test_utils::{create_test_user, png_bytes, ScriptedProvider};
    use bytes::Bytes;
    use std::time::Duration;

    fn png(name: &str) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            content_type: Some("image/png".to_string()),
            data: Bytes::from(png_bytes()),
        }
    }

    fn not_an_image(name: &str) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            content_type: Some("image/png".to_string()),
            data: Bytes::from_static(b"plain text"),
        }
    }

    fn orchestrator(pool: &sqlx::SqlitePool, provider: Arc<ScriptedProvider>) -> BatchOrchestrator {
        let processor = Processor::new(pool.clone(), provider, UploadConfig::default(), 1);
        BatchOrchestrator::new(processor, BatchConfig::default())
    }

    async fn collect(mut rx: mpsc::Receiver<BatchEvent>) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn run(
        pool: &sqlx::SqlitePool,
        provider: Arc<ScriptedProvider>,
        user_id: &str,
        files: Vec<UploadedFile>,
        mode: BatchMode,
    ) -> (Option<BatchSummary>, Vec<BatchEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let summary = orchestrator(pool, provider)
            .run(user_id.to_string(), files, mode, tx)
            .await;
        (summary, collect(rx).await)
    }

    #[tokio::test]
    async fn test_preflight_rejects_insufficient_credits() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "pre@example.com", 2).await;
        let provider = Arc::new(ScriptedProvider::always_ok());
        let orch = orchestrator(&pool, provider.clone());

        let err = orch.preflight(&user.id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::Ledger(LedgerError::InsufficientCredits {
                balance: 2,
                required: 3
            })
        ));
        assert_eq!(orch.preflight(&user.id, 2).await.unwrap(), 2);
        assert!(matches!(orch.preflight(&user.id, 0).await, Err(BatchError::NoFiles)));
        assert!(matches!(
            orch.preflight(&user.id, 51).await,
            Err(BatchError::TooManyFiles { count: 51, max: 50 })
        ));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_sequential_partial_failure() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "seq@example.com", 10).await;
        let provider = Arc::new(ScriptedProvider::failing_on(&["bad.png"]));

        let files = vec![png("a.png"), not_an_image("text.png"), png("bad.png"), png("b.png")];
        let (summary, events) = run(&pool, provider.clone(), &user.id, files, BatchMode::Sequential).await;
        let summary = summary.unwrap();

        assert_eq!(summary.processed, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.credits_used, 2);
        assert_eq!(summary.credits_remaining, 8);
        assert!(!summary.stopped_early);
        // The invalid file never reaches the provider
        assert_eq!(provider.calls(), 3);

        // progress + result per file, then complete
        assert_eq!(events.len(), 9);
        assert!(matches!(events[0], BatchEvent::Progress { index: 0, total: 4, .. }));
        assert!(matches!(
            &events[1],
            BatchEvent::Result { index: 0, success: true, credits_remaining: Some(9), .. }
        ));
        assert!(matches!(&events[3], BatchEvent::Result { index: 1, success: false, .. }));
        assert!(matches!(&events[5], BatchEvent::Result { index: 2, success: false, .. }));
        assert!(matches!(events[8], BatchEvent::Complete { succeeded: 2, failed: 2, .. }));

        assert!(find_ledger_mismatches(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_stops_when_credits_run_out() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "stop@example.com", 2).await;
        let provider = Arc::new(ScriptedProvider::always_ok());

        let files = (0..5).map(|i| png(&format!("{}.png", i))).collect();
        let (summary, events) = run(&pool, provider.clone(), &user.id, files, BatchMode::Sequential).await;
        let summary = summary.unwrap();

        assert!(summary.stopped_early);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.credits_used, 2);
        assert_eq!(summary.credits_remaining, 0);
        assert_eq!(provider.calls(), 2);
        assert!(matches!(
            events.last(),
            Some(BatchEvent::Complete { stopped_early: true, processed: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_window_and_single_charge() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "conc@example.com", 20).await;
        let provider = Arc::new(
            ScriptedProvider::failing_on(&["3.png", "11.png"]).with_delay(Duration::from_millis(20)),
        );

        let files: Vec<_> = (0..12).map(|i| png(&format!("{}.png", i))).collect();
        let (summary, events) = run(&pool, provider.clone(), &user.id, files, BatchMode::Concurrent).await;
        let summary = summary.unwrap();

        assert_eq!(summary.succeeded, 10);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.credits_used, 10);
        assert_eq!(summary.credits_remaining, 10);
        assert_eq!(provider.calls(), 12);
        assert!(provider.max_in_flight() <= 5);
        assert!(provider.max_in_flight() >= 2);

        // Results carry every index exactly once
        let mut indexes: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Result { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        indexes.sort();
        assert_eq!(indexes, (0..12).collect::<Vec<_>>());

        // One aggregate usage row
        let txs = crate::db::list_user_transactions(&pool, &user.id, &Default::default())
            .await
            .unwrap();
        let usage: Vec<_> = txs
            .items
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Usage)
            .collect();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].amount, -10);

        let stored = list_user_descriptions(&pool, &user.id, &Default::default()).await.unwrap();
        assert_eq!(stored.total, 10);
        assert!(find_ledger_mismatches(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_final_deduct_failure_ends_with_error() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "spent@example.com", 2).await;
        let provider = Arc::new(ScriptedProvider::always_ok());
        let orch = orchestrator(&pool, provider.clone());

        assert_eq!(orch.preflight(&user.id, 2).await.unwrap(), 2);
        // Spent by another request before the batch settles
        ledger::deduct(&pool, &user.id, 2, Some("elsewhere")).await.unwrap();

        let (tx, rx) = mpsc::channel(256);
        let summary = orch
            .run(user.id.clone(), vec![png("a.png"), png("b.png")], BatchMode::Concurrent, tx)
            .await;
        let events = collect(rx).await;

        assert!(summary.is_none());
        assert_eq!(provider.calls(), 2);
        let names: Vec<_> = events.iter().map(BatchEvent::name).collect();
        assert_eq!(names.iter().filter(|n| **n == "result").count(), 2);
        assert!(!names.contains(&"complete"));
        assert!(matches!(events.last(), Some(BatchEvent::Error { .. })));

        // Both descriptions stay stored, uncharged; the ledger is untouched
        let stored = list_user_descriptions(&pool, &user.id, &Default::default()).await.unwrap();
        assert_eq!(stored.total, 2);
        assert_eq!(ledger::balance(&pool, &user.id).await.unwrap(), 0);
        assert!(find_ledger_mismatches(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_failures_charge_nothing() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "none@example.com", 3).await;
        let provider = Arc::new(ScriptedProvider::failing_on(&["a.png", "b.png"]));

        for mode in [BatchMode::Sequential, BatchMode::Concurrent] {
            let files = vec![png("a.png"), png("b.png"), not_an_image("c.png")];
            let (summary, _) = run(&pool, provider.clone(), &user.id, files, mode).await;
            let summary = summary.unwrap();
            assert_eq!(summary.succeeded, 0);
            assert_eq!(summary.credits_used, 0);
            assert_eq!(summary.credits_remaining, 3);
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_stop_batch() {
        let pool = init_memory().await.unwrap();
        let user = create_test_user(&pool, "gone@example.com", 5).await;
        let provider = Arc::new(ScriptedProvider::always_ok());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let summary = orchestrator(&pool, provider)
            .run(user.id.clone(), vec![png("a.png"), png("b.png")], BatchMode::Sequential, tx)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(ledger::balance(&pool, &user.id).await.unwrap(), 3);
    }

    #[test]
    fn test_event_wire_format() {
        let event = BatchEvent::Progress {
            index: 0,
            total: 2,
            filename: "a.png".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "progress", "index": 0, "total": 2, "filename": "a.png"})
        );

        let failed = BatchEvent::Result {
            index: 1,
            filename: "b.png".into(),
            success: false,
            description_id: None,
            description: None,
            error: Some("boom".into()),
            credits_remaining: None,
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"type": "result", "index": 1, "filename": "b.png", "success": false, "error": "boom"})
        );
        assert_eq!(failed.name(), "result");
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(serde_json::from_str::<BatchMode>("\"concurrent\"").unwrap(), BatchMode::Concurrent);
        assert_eq!(BatchMode::default(), BatchMode::Sequential);
    }
}
