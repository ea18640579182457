//! # Batch Logger
//!
//! Buffers training records and flushes them to one file per record, either
//! when the queue reaches `batch_size` or on a periodic timer. Both triggers
//! drain the queue through a single locked dequeue, so each record is
//! flushed exactly once.
//!
//! Durability is best-effort. When the training directory holds
//! `max_files_in_dir` items or more, a flush drops its batch with a warning
//! instead of growing the directory. When the in-memory queue is full, new
//! records are dropped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::LogRecord;
use crate::sanitization::{limit_length, redact_message, MAX_MESSAGE_CHARS};
use crate::state_store::{ApplyOutcome, StateStore};
use crate::types::Result;

/// Configuration for batch persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush, and the most records one flush takes
    pub batch_size: usize,
    /// Period of the background flush timer
    #[serde(with = "crate::config::duration_secs")]
    pub flush_interval: Duration,
    /// Item count in the training directory at which flushes are abandoned
    pub max_files_in_dir: usize,
    /// Largest serialized record that will be written
    pub max_file_size: usize,
    /// Records held in memory before new ones are dropped
    pub max_queue_len: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_files_in_dir: 10_000,
            max_file_size: 10 * 1024 * 1024,
            max_queue_len: 10_000,
        }
    }
}

/// What a single flush did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records taken off the queue
    pub dequeued: usize,
    /// Records durably written
    pub written: usize,
    /// Records skipped for exceeding `max_file_size`
    pub skipped_oversized: usize,
    /// Records whose write failed
    pub failed: usize,
    /// Records dropped because the directory quota was reached
    pub dropped_for_quota: usize,
}

/// Buffered writer of training records
#[derive(Debug)]
pub struct BatchLogger {
    config: BatchConfig,
    dir: PathBuf,
    queue: Mutex<VecDeque<LogRecord>>,
    state_store: Arc<StateStore>,
    state_updates: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl BatchLogger {
    pub fn new(config: BatchConfig, dir: PathBuf, state_store: Arc<StateStore>) -> Self {
        Self {
            config,
            dir,
            queue: Mutex::new(VecDeque::new()),
            state_store,
            state_updates: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues a record. Never blocks; records with learning disabled are ignored.
    pub fn enqueue(self: &Arc<Self>, record: LogRecord) {
        if !record.classification().learning_enabled {
            debug!(
                classification = %record.classification().classification,
                "Learning disabled, record not logged"
            );
            return;
        }

        let queued = {
            let mut queue = lock(&self.queue);
            if queue.len() >= self.config.max_queue_len {
                drop(queue);
                counter!("error_classifier.queue.dropped", 1);
                warn!(
                    max_queue_len = self.config.max_queue_len,
                    "Training queue full, dropping record"
                );
                return;
            }
            queue.push_back(record);
            queue.len()
        };
        gauge!("error_classifier.queue.size", queued as f64);

        if queued >= self.config.batch_size {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let logger = Arc::clone(self);
                    handle.spawn(async move {
                        logger.flush().await;
                    });
                }
                Err(_) => debug!("No async runtime, deferring flush to the timer"),
            }
        }
    }

    /// Number of records waiting to be flushed
    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Takes up to `batch_size` records off the head of the queue
    fn dequeue_batch(&self) -> Vec<LogRecord> {
        let mut queue = lock(&self.queue);
        let take = queue.len().min(self.config.batch_size);
        queue.drain(..take).collect()
    }

    /// Flushes one batch to disk and schedules the aggregate state update
    pub async fn flush(self: &Arc<Self>) -> FlushReport {
        let batch = self.dequeue_batch();
        let mut report = FlushReport {
            dequeued: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return report;
        }

        let file_count = match self.prepare_dir().await {
            Ok(count) => count,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "Training directory unavailable, dropping batch");
                report.failed = batch.len();
                return report;
            }
        };

        if file_count >= self.config.max_files_in_dir {
            counter!("error_classifier.batch.dropped", batch.len() as u64);
            warn!(
                file_count,
                max_files = self.config.max_files_in_dir,
                dropped = batch.len(),
                "Training directory at capacity, dropping batch"
            );
            report.dropped_for_quota = batch.len();
            return report;
        }

        let mut written = Vec::with_capacity(batch.len());
        for mut record in batch {
            let context = record.context_mut();
            if let Some(message) = context.error_message.take() {
                // Redaction markers can outgrow the secret they replace
                context.error_message = Some(limit_length(&redact_message(&message), MAX_MESSAGE_CHARS));
            }

            let bytes = match serde_json::to_vec(&record) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize training record");
                    report.failed += 1;
                    continue;
                }
            };

            if bytes.len() > self.config.max_file_size {
                counter!("error_classifier.batch.skipped_oversized", 1);
                warn!(
                    size = bytes.len(),
                    limit = self.config.max_file_size,
                    "Training record too large, skipping"
                );
                report.skipped_oversized += 1;
                continue;
            }

            let path = self.dir.join(format!(
                "{}_{}.json",
                Utc::now().timestamp_millis(),
                Uuid::new_v4()
            ));
            match tokio::fs::write(&path, &bytes).await {
                Ok(()) => written.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to write training record");
                    report.failed += 1;
                }
            }
        }

        report.written = written.len();
        counter!("error_classifier.batch.flushed", written.len() as u64);
        gauge!("error_classifier.queue.size", self.queue_len() as f64);
        debug!(
            written = report.written,
            skipped = report.skipped_oversized,
            failed = report.failed,
            "Training batch flushed"
        );

        if !written.is_empty() {
            self.schedule_state_update(written);
        }
        report
    }

    /// Ensures the training directory exists and counts its items
    async fn prepare_dir(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.count_files().await
    }

    /// Number of items in the training directory
    pub async fn count_files(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut count = 0;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    fn schedule_state_update(&self, written: Vec<LogRecord>) {
        let store = Arc::clone(&self.state_store);
        let handle = tokio::spawn(async move {
            match store.apply_batch(&written).await {
                Ok(ApplyOutcome::Persisted(state)) => {
                    debug!(total = state.total_classifications, "Aggregate state updated");
                }
                Ok(ApplyOutcome::SkippedTooLarge { size }) => {
                    warn!(size, "Aggregate state not updated, serialized state too large");
                }
                Err(e) => warn!(error = %e, "Aggregate state update failed"),
            }
        });

        let mut updates = lock(&self.state_updates);
        updates.retain(|h| !h.is_finished());
        updates.push(handle);
    }

    /// Waits for every scheduled state update to finish
    pub async fn wait_for_state_updates(&self) {
        let handles: Vec<_> = std::mem::take(&mut *lock(&self.state_updates));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "State update task failed");
            }
        }
    }

    /// Starts the periodic flush timer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let logger = Arc::clone(self);
        let period = self.config.flush_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        logger.flush().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        info!(interval_ms = period.as_millis() as u64, "Batch flush timer started");
        *timer = Some((stop_tx, handle));
    }

    /// Stops the timer, drains the queue and waits for state updates
    pub async fn shutdown(self: &Arc<Self>) {
        let timer = lock(&self.timer).take();
        if let Some((stop_tx, handle)) = timer {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                error!(error = %e, "Flush timer task failed");
            }
        }

        loop {
            let report = self.flush().await;
            if report.dequeued == 0 {
                break;
            }
        }

        self.wait_for_state_updates().await;
        info!("Batch logger shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
