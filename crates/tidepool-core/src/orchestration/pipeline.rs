// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work-item pipeline: routes dispatched message batches to an instance connection
//! and folds the results back into the task hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::connection::{InstanceConnection, InstanceUpdate};
use super::hub::TaskHub;
use crate::cache::lock;
use crate::error::{CacheError, Result};
use crate::sync::{Dequeue, PartitionBatch};

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batches executed at the same time.
    pub max_concurrent_dispatches: usize,
    /// Pause before a batch is retried after a disconnect or a failed update.
    pub disconnect_retry_delay: Duration,
    /// Delete messages discarded because their target instance has no record.
    ///
    /// Off by default: discarded messages stay stored and are re-dispatched when
    /// the hub is reopened.
    pub purge_orphaned_messages: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: 32,
            disconnect_retry_delay: Duration::from_secs(1),
            purge_orphaned_messages: false,
        }
    }
}

/// History position the connection's cursor for an instance was last advanced to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CursorMark {
    execution_id: Option<String>,
    events: usize,
}

/// How one batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Applied,
    Discarded,
    Empty,
    Retry,
}

struct PipelineInner {
    hub: TaskHub,
    connection: Arc<dyn InstanceConnection>,
    config: PipelineConfig,
    cursors: Mutex<HashMap<String, CursorMark>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Drains the dispatch queue of a [`TaskHub`] into an [`InstanceConnection`].
///
/// Each instance has at most one batch in flight. An instance whose stored history
/// still matches what the connection last saw only receives the new messages; any
/// other instance is sent its full state and history.
#[derive(Clone)]
pub struct WorkItemPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for WorkItemPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemPipeline")
            .field("config", &self.inner.config)
            .field("cursors", &lock(&self.inner.cursors).len())
            .field("connection", &"...")
            .finish()
    }
}

impl WorkItemPipeline {
    pub fn new(
        hub: TaskHub,
        connection: Arc<dyn InstanceConnection>,
        config: PipelineConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1)));
        Self {
            inner: Arc::new(PipelineInner {
                hub,
                connection,
                config,
                cursors: Mutex::new(HashMap::new()),
                permits,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Token that stops [`run`](Self::run).
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Run until shutdown, then wait for in-flight batches.
    pub async fn run(&self) {
        info!(
            max_concurrent = self.inner.config.max_concurrent_dispatches,
            "Work-item pipeline started"
        );

        let mut tasks = JoinSet::new();
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                permit = self.inner.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Dispatch semaphore closed");
                        break;
                    }
                },
            };

            let batch = match self
                .inner
                .hub
                .dispatch_queue()
                .next_batch(None, &self.inner.shutdown)
                .await
            {
                Dequeue::Item(batch) => batch,
                Dequeue::TimedOut => continue,
                Dequeue::Cancelled => break,
            };

            let pipeline = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                pipeline.dispatch_batch(batch).await;
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Dispatch task failed");
                }
            }
        }

        info!(in_flight = tasks.len(), "Work-item pipeline stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch task failed");
            }
        }
        info!("Work-item pipeline stopped");
    }

    /// Execute one batch and release or requeue its instance.
    pub async fn dispatch_batch(&self, batch: PartitionBatch<String, u64>) {
        let queue = self.inner.hub.dispatch_queue();
        let retry = match self.execute(&batch.key, &batch.items).await {
            Ok(DispatchOutcome::Retry) => true,
            Ok(_) => false,
            Err(CacheError::HistoryConflict {
                expected, actual, ..
            }) => {
                warn!(
                    instance_id = %batch.key,
                    expected,
                    actual,
                    "History moved while executing; retrying from stored state"
                );
                queue.requeue(batch);
                return;
            }
            Err(CacheError::InstanceFinished { status, .. }) => {
                info!(
                    instance_id = %batch.key,
                    status = %status,
                    "Instance finished while executing; rechecking batch"
                );
                queue.requeue(batch);
                return;
            }
            Err(e) => {
                error!(instance_id = %batch.key, error = %e, "Dispatch failed");
                true
            }
        };

        if !retry {
            queue.complete(&batch.key);
            return;
        }

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.inner.config.disconnect_retry_delay) => {}
        }
        queue.requeue(batch);
    }

    #[instrument(skip(self, sequences), fields(messages = sequences.len()))]
    async fn execute(&self, instance_id: &str, sequences: &[u64]) -> Result<DispatchOutcome> {
        let hub = &self.inner.hub;
        let connection = &self.inner.connection;

        // 1. Resolve the batch; consumed messages are skipped
        let messages = hub.pending_messages(sequences);
        if messages.is_empty() {
            return Ok(DispatchOutcome::Empty);
        }
        let consumed: Vec<u64> = messages.iter().map(|m| m.sequence).collect();

        // 2. Load state and history in one prefetch batch
        let (state, history) = hub.load_instance(instance_id).await?;
        let mark = CursorMark {
            execution_id: history.execution_id.clone(),
            events: history.len(),
        };

        // 3. Execute
        let orphaned = state.is_none();
        let starts = messages.iter().any(|m| m.event.is_execution_started());
        let current = !starts
            && connection.is_connected(instance_id)
            && lock(&self.inner.cursors).get(instance_id) == Some(&mark);
        let result = if current {
            connection.process_messages(instance_id, messages).await
        } else {
            connection
                .process_history_and_messages(instance_id, state, history, messages)
                .await
        };

        // 4. Fold the result back
        let next_mark = match &result {
            InstanceUpdate::Disconnected { reason } => {
                warn!(reason = %reason, "Instance connection disconnected");
                self.forget(instance_id);
                return Ok(DispatchOutcome::Retry);
            }
            InstanceUpdate::DiscardMessages { reason } => {
                info!(reason = %reason, "Messages discarded");
                if orphaned && self.inner.config.purge_orphaned_messages {
                    let purged = hub.purge_messages(instance_id, &consumed).await?;
                    debug!(purged, "Orphaned messages purged");
                }
                return Ok(DispatchOutcome::Discarded);
            }
            InstanceUpdate::AppendHistoryEvents {
                position,
                new_events,
                state,
                ..
            } => Some(CursorMark {
                execution_id: Some(state.execution_id.clone()),
                events: position + new_events.len(),
            }),
            InstanceUpdate::NewHistory { history, .. } => Some(CursorMark {
                execution_id: history.execution_id.clone(),
                events: history.len(),
            }),
            InstanceUpdate::DeleteInstance => None,
        };

        if let Err(e) = hub.apply_instance_update(instance_id, &consumed, result).await {
            self.forget(instance_id);
            return Err(e);
        }

        let mut cursors = lock(&self.inner.cursors);
        match next_mark {
            Some(mark) => {
                cursors.insert(instance_id.to_string(), mark);
            }
            None => {
                cursors.remove(instance_id);
            }
        }
        debug!(consumed = consumed.len(), "Batch applied");
        Ok(DispatchOutcome::Applied)
    }

    fn forget(&self, instance_id: &str) {
        lock(&self.inner.cursors).remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheEngine};
    use crate::orchestration::{
        EventKind, History, HistoryEvent, InstanceRecord, InstanceStatus, OutboundMessages,
        TaskMessage,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Connection that replies with a fixed result and counts calls.
    struct ScriptedConnection {
        reply: Mutex<Vec<InstanceUpdate>>,
        full: Mutex<usize>,
        incremental: Mutex<usize>,
    }

    impl ScriptedConnection {
        fn new(replies: Vec<InstanceUpdate>) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(replies),
                full: Mutex::new(0),
                incremental: Mutex::new(0),
            })
        }

        fn next_reply(&self) -> InstanceUpdate {
            let mut replies = self.reply.lock().unwrap();
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            }
        }
    }

    #[async_trait]
    impl InstanceConnection for ScriptedConnection {
        async fn process_history_and_messages(
            &self,
            _instance_id: &str,
            _state: Option<InstanceRecord>,
            _history: History,
            _messages: Vec<TaskMessage>,
        ) -> InstanceUpdate {
            *self.full.lock().unwrap() += 1;
            self.next_reply()
        }

        async fn process_messages(
            &self,
            _instance_id: &str,
            _messages: Vec<TaskMessage>,
        ) -> InstanceUpdate {
            *self.incremental.lock().unwrap() += 1;
            self.next_reply()
        }

        fn is_connected(&self, _instance_id: &str) -> bool {
            true
        }

        async fn close(&self, _reason: &str) {}
    }

    async fn pipeline(connection: Arc<ScriptedConnection>) -> WorkItemPipeline {
        let engine = CacheEngine::new(CacheConfig::default(), Arc::new(MemoryStore::new()));
        let hub = TaskHub::open(engine).await.unwrap();
        WorkItemPipeline::new(
            hub,
            connection,
            PipelineConfig {
                max_concurrent_dispatches: 4,
                disconnect_retry_delay: Duration::from_millis(10),
                purge_orphaned_messages: false,
            },
        )
    }

    async fn next_batch(pipeline: &WorkItemPipeline) -> Option<PartitionBatch<String, u64>> {
        pipeline
            .inner
            .hub
            .dispatch_queue()
            .next_batch(Some(Duration::from_millis(50)), &CancellationToken::new())
            .await
            .into_item()
    }

    #[tokio::test]
    async fn test_discard_completes_batch_without_mutation() {
        let connection = ScriptedConnection::new(vec![InstanceUpdate::DiscardMessages {
            reason: "no start event".to_string(),
        }]);
        let pipeline = pipeline(connection.clone()).await;
        let hub = pipeline.inner.hub.clone();
        hub.raise_event("order-1", "approve", None).unwrap();
        let committed = hub.engine().last_committed();

        let batch = next_batch(&pipeline).await.unwrap();
        pipeline.dispatch_batch(batch.clone()).await;

        assert_eq!(hub.engine().last_committed(), committed);
        assert_eq!(hub.pending_messages(&batch.items).len(), 1);
        assert_eq!(hub.dispatch_queue().in_flight_len(), 0);
        assert!(next_batch(&pipeline).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_requeues_batch() {
        let connection = ScriptedConnection::new(vec![InstanceUpdate::Disconnected {
            reason: "worker gone".to_string(),
        }]);
        let pipeline = pipeline(connection.clone()).await;
        let hub = pipeline.inner.hub.clone();
        hub.raise_event("order-1", "approve", None).unwrap();

        let batch = next_batch(&pipeline).await.unwrap();
        pipeline.dispatch_batch(batch.clone()).await;

        let again = next_batch(&pipeline).await.unwrap();
        assert_eq!(again, batch);
    }

    #[tokio::test]
    async fn test_delete_instance_consumes_messages() {
        let connection = ScriptedConnection::new(vec![InstanceUpdate::DeleteInstance]);
        let pipeline = pipeline(connection.clone()).await;
        let hub = pipeline.inner.hub.clone();
        hub.raise_event("@counter@a", "delete", None).unwrap();

        let batch = next_batch(&pipeline).await.unwrap();
        pipeline.dispatch_batch(batch.clone()).await;

        assert!(hub.pending_messages(&batch.items).is_empty());
        assert!(hub.get_instance("@counter@a").await.unwrap().is_none());
        assert_eq!(*connection.full.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_result_for_finished_instance_is_requeued() {
        let start = TaskMessage::new(
            "order-1",
            EventKind::ExecutionStarted {
                name: "Flow".to_string(),
                version: None,
                input: None,
            },
        );
        let connection = ScriptedConnection::new(Vec::new());
        let pipeline = pipeline(connection.clone()).await;
        let hub = pipeline.inner.hub.clone();
        hub.create_instance(start.clone(), &[]).await.unwrap();
        let mut record = hub.get_instance("order-1").await.unwrap().unwrap();
        record.status = InstanceStatus::Running;
        *connection.reply.lock().unwrap() = vec![
            InstanceUpdate::AppendHistoryEvents {
                position: 0,
                new_events: vec![start.event],
                state: record,
                outbound: OutboundMessages::default(),
            },
            InstanceUpdate::DiscardMessages {
                reason: "instance is terminated".to_string(),
            },
        ];

        let batch = next_batch(&pipeline).await.unwrap();
        assert!(hub.terminate_instance("order-1", "stop").await.unwrap());
        pipeline.dispatch_batch(batch.clone()).await;

        let again = next_batch(&pipeline).await.unwrap();
        assert_eq!(again, batch);
        pipeline.dispatch_batch(again).await;

        let record = hub.get_instance("order-1").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Terminated);
        assert!(hub.get_history("order-1").await.unwrap().is_none());
        assert_eq!(*connection.full.lock().unwrap(), 2);
        assert!(next_batch(&pipeline).await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let connection = ScriptedConnection::new(vec![InstanceUpdate::DiscardMessages {
            reason: "unused".to_string(),
        }]);
        let pipeline = pipeline(connection).await;
        let shutdown = pipeline.shutdown_handle();

        let handle = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run().await }
        });
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_known_cursor_receives_only_messages() {
        let now = chrono::Utc::now();
        let state = InstanceRecord {
            instance_id: "order-1".to_string(),
            execution_id: "e1".to_string(),
            name: "Flow".to_string(),
            version: None,
            status: InstanceStatus::Running,
            input: None,
            output: None,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
        };
        let step = |position: usize| InstanceUpdate::AppendHistoryEvents {
            position,
            new_events: vec![HistoryEvent::new(position as u64, EventKind::OrchestratorStarted)],
            state: state.clone(),
            outbound: OutboundMessages::default(),
        };
        let connection = ScriptedConnection::new(vec![step(0), step(1)]);
        let pipeline = pipeline(connection.clone()).await;
        let hub = pipeline.inner.hub.clone();

        hub.raise_event("order-1", "first", None).unwrap();
        let batch = next_batch(&pipeline).await.unwrap();
        pipeline.dispatch_batch(batch).await;

        hub.raise_event("order-1", "second", None).unwrap();
        let batch = next_batch(&pipeline).await.unwrap();
        pipeline.dispatch_batch(batch).await;

        assert_eq!(*connection.full.lock().unwrap(), 1);
        assert_eq!(*connection.incremental.lock().unwrap(), 1);
        assert_eq!(hub.get_history("order-1").await.unwrap().unwrap().len(), 2);
        assert_eq!(hub.load_metrics().pending_messages, 0);
    }
}
