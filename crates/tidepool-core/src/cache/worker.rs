// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that turns commit notifications into checkpoint writes.
//!
//! Commits set an auto-reset signal through a completion listener registered on
//! every partition, so a burst of commits collapses into one checkpoint cycle.
//! A failed write keeps the collected command and retries it unchanged; nothing
//! new is collected until it succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checkpoint::CheckpointCommand;
use super::engine::CacheEngine;
use super::CheckpointId;
use crate::error::Result;
use crate::sync::{AsyncSignal, SignalWait};

/// Configuration for the checkpoint worker.
#[derive(Debug, Clone)]
pub struct CheckpointWorkerConfig {
    /// How long to wait after a wake-up so further commits join the same checkpoint.
    pub coalesce_delay: Duration,
    /// Delay before the first retry of a failed write.
    pub retry_backoff: Duration,
    /// Upper bound of the doubling retry delay.
    pub max_retry_backoff: Duration,
    /// Failed write attempts tolerated while flushing on shutdown.
    pub shutdown_attempts: u32,
}

impl Default for CheckpointWorkerConfig {
    fn default() -> Self {
        Self {
            coalesce_delay: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_secs(5),
            shutdown_attempts: 3,
        }
    }
}

/// Counters exposed by a running worker.
#[derive(Debug, Default)]
pub struct CheckpointStats {
    checkpoints: AtomicU64,
    rows_written: AtomicU64,
    failed_writes: AtomicU64,
}

impl CheckpointStats {
    /// Checkpoints written successfully.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Row deltas written successfully.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Writes that failed and were retried.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}

/// Batching background task that writes checkpoints.
pub struct CheckpointWorker {
    engine: CacheEngine,
    config: CheckpointWorkerConfig,
    signal: Arc<AsyncSignal>,
    shutdown: CancellationToken,
    stats: Arc<CheckpointStats>,
    pending: Mutex<Option<CheckpointCommand>>,
}

impl CheckpointWorker {
    /// Create a worker and subscribe it to every partition of `engine`.
    pub fn new(engine: CacheEngine, config: CheckpointWorkerConfig) -> Self {
        let signal = Arc::new(AsyncSignal::new());
        let wake = signal.clone();
        engine.add_completion_listener_all(move |_| wake.set());

        Self {
            engine,
            config,
            signal,
            shutdown: CancellationToken::new(),
            stats: Arc::new(CheckpointStats::default()),
            pending: Mutex::new(None),
        }
    }

    /// Token that stops [`run`](Self::run) after a final flush.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<CheckpointStats> {
        self.stats.clone()
    }

    /// Wake the worker even if no commit happened.
    pub fn request_checkpoint(&self) {
        self.signal.set();
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) {
        info!(
            coalesce_delay_ms = self.config.coalesce_delay.as_millis() as u64,
            "Checkpoint worker started"
        );

        loop {
            match self.signal.wait(None, &self.shutdown).await {
                SignalWait::Cancelled => {
                    info!("Checkpoint worker received shutdown signal");
                    break;
                }
                SignalWait::TimedOut => continue,
                SignalWait::Signaled => {}
            }

            if !self.config.coalesce_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.coalesce_delay) => {}
                }
            }

            self.run_cycle().await;
        }

        self.final_flush().await;
        info!(
            checkpoints = self.stats.checkpoints(),
            rows_written = self.stats.rows_written(),
            failed_writes = self.stats.failed_writes(),
            "Checkpoint worker stopped"
        );
    }

    /// Write one checkpoint, retrying until it succeeds or shutdown is requested.
    async fn run_cycle(&self) {
        let mut backoff = self.config.retry_backoff;
        loop {
            match self.checkpoint_once().await {
                Ok(_) => {
                    if self.engine.has_pending_checkpoint() {
                        self.signal.set();
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Checkpoint write failed"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                }
            }
        }
    }

    async fn final_flush(&self) {
        let mut failures = 0;
        loop {
            match self.checkpoint_once().await {
                Ok(None) => break,
                Ok(Some(_)) => continue,
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.shutdown_attempts {
                        error!(
                            error = %e,
                            attempts = failures,
                            "Giving up on final checkpoint; unflushed state is lost"
                        );
                        break;
                    }
                    warn!(error = %e, attempt = failures, "Final checkpoint failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    /// Write the pending command, or collect and write a new one.
    ///
    /// Returns `Ok(None)` when there was nothing to checkpoint.
    pub async fn checkpoint_once(&self) -> Result<Option<CheckpointId>> {
        let mut pending = self.pending.lock().await;

        let command = match pending.as_mut() {
            Some(command) => command,
            None => {
                if !self.engine.has_pending_checkpoint() {
                    return Ok(None);
                }
                let mut command = CheckpointCommand::new();
                self.engine.collect_next_checkpoint(&mut command)?;
                pending.insert(command)
            }
        };

        let checkpoint_id = command.checkpoint_id();
        let rows = command.row_count() as u64;
        if let Err(e) = command.execute(self.engine.store().as_ref()).await {
            self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        *pending = None;

        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.stats.rows_written.fetch_add(rows, Ordering::Relaxed);
        debug!(checkpoint_id = ?checkpoint_id, rows, "Checkpoint cycle complete");
        Ok(checkpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, Partitioner, Table};
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, CacheEngine, Table<String, String>) {
        let store = Arc::new(MemoryStore::new());
        let engine = CacheEngine::new(CacheConfig { partition_count: 2 }, store.clone());
        let table = engine
            .register_table("Notes", Partitioner::Hashed)
            .unwrap();
        (store, engine, table)
    }

    #[tokio::test]
    async fn test_idle_worker_writes_nothing() {
        let (store, engine, _) = setup();
        let worker = CheckpointWorker::new(engine, CheckpointWorkerConfig::default());

        assert_eq!(worker.checkpoint_once().await.unwrap(), None);
        assert!(store.written_checkpoints().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_with_same_command() {
        let (store, engine, table) = setup();
        let worker = CheckpointWorker::new(engine.clone(), CheckpointWorkerConfig::default());

        let mut tx = engine.start_transaction(None);
        tx.create(&table, "a".to_string(), "first".to_string()).unwrap();
        tx.commit().unwrap();

        store.fail_next_writes(1);
        assert!(worker.checkpoint_once().await.is_err());

        let mut tx = engine.start_transaction(None);
        tx.create(&table, "b".to_string(), "second".to_string()).unwrap();
        tx.commit().unwrap();

        assert_eq!(worker.checkpoint_once().await.unwrap(), Some(CheckpointId(1)));
        assert!(store.row("Notes", "\"a\"").is_some());
        assert!(store.row("Notes", "\"b\"").is_none());

        assert_eq!(worker.checkpoint_once().await.unwrap(), Some(CheckpointId(2)));
        assert!(store.row("Notes", "\"b\"").is_some());
        assert_eq!(worker.stats().failed_writes(), 1);
        assert_eq!(worker.stats().checkpoints(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_flushes_commits_and_stops() {
        let (store, engine, table) = setup();
        let worker = Arc::new(CheckpointWorker::new(
            engine.clone(),
            CheckpointWorkerConfig {
                coalesce_delay: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let shutdown = worker.shutdown_handle();
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        let (tx_done, rx_done) = tokio::sync::oneshot::channel();
        let mut tx = engine.start_transaction(None);
        tx.create(&table, "a".to_string(), "value".to_string()).unwrap();
        tx.on_persisted(move |id| {
            let _ = tx_done.send(id);
        });
        let committed = tx.commit().unwrap();

        let persisted = tokio::time::timeout(Duration::from_secs(5), rx_done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted, committed);
        assert_eq!(
            store.row("Notes", "\"a\""),
            Some(serde_json::json!("value"))
        );

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_state() {
        let (store, engine, table) = setup();
        let worker = CheckpointWorker::new(
            engine.clone(),
            CheckpointWorkerConfig {
                coalesce_delay: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let mut tx = engine.start_transaction(None);
        tx.create(&table, "late".to_string(), "value".to_string()).unwrap();
        tx.commit().unwrap();

        worker.shutdown_handle().cancel();
        worker.run().await;

        assert!(store.row("Notes", "\"late\"").is_some());
        assert!(!engine.has_pending_checkpoint());
    }
}
