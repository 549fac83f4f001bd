// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task hub: client operations over the orchestration tables.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::connection::InstanceUpdate;
use super::creation::{CreationDecision, handle_creation_request};
use super::tables::TaskHubTables;
use super::types::{
    ActivityMessage, EventKind, History, HistoryEvent, InstanceRecord, InstanceStatus,
    TaskMessage,
};
use crate::cache::{CacheEngine, TransactionId, TxContext};
use crate::error::{CacheError, Result};
use crate::scale::LoadMetrics;
use crate::sync::{Dequeue, PartitionedWorkQueue, WorkItemQueue};

struct HubInner {
    engine: CacheEngine,
    tables: TaskHubTables,
    /// Message sequence numbers grouped by target instance.
    dispatch: Arc<PartitionedWorkQueue<String, u64>>,
    /// Activity sequence numbers.
    activities: Arc<WorkItemQueue<u64>>,
    next_sequence: AtomicU64,
}

/// Client surface of the durable orchestration state.
///
/// Every mutation runs as one cache transaction. Stored messages become visible to
/// the dispatch queue, in commit order, when their transaction commits.
#[derive(Clone)]
pub struct TaskHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for TaskHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHub")
            .field("engine", &self.inner.engine)
            .field("next_sequence", &self.inner.next_sequence)
            .finish()
    }
}

impl TaskHub {
    /// Register the task hub tables and re-enqueue everything left pending in the store.
    #[instrument(skip(engine))]
    pub async fn open(engine: CacheEngine) -> Result<Self> {
        let tables = TaskHubTables::register(&engine)?;
        let dispatch = Arc::new(PartitionedWorkQueue::new());
        let activities = Arc::new(WorkItemQueue::new());

        let mut messages = tables.messages.table().preload_from_store().await?;
        messages.sort_by_key(|(sequence, _)| *sequence);
        let mut pending = tables.activities.table().preload_from_store().await?;
        pending.sort_by_key(|(sequence, _)| *sequence);

        let last = messages
            .iter()
            .map(|(sequence, _)| *sequence)
            .chain(pending.iter().map(|(sequence, _)| *sequence))
            .max()
            .unwrap_or(0);

        for (sequence, message) in &messages {
            dispatch.enqueue(message.instance_id.clone(), *sequence);
        }
        for (sequence, _) in &pending {
            activities.enqueue(*sequence);
        }

        info!(
            messages = messages.len(),
            activities = pending.len(),
            next_sequence = last + 1,
            "Task hub opened"
        );

        Ok(Self {
            inner: Arc::new(HubInner {
                engine,
                tables,
                dispatch,
                activities,
                next_sequence: AtomicU64::new(last + 1),
            }),
        })
    }

    /// The cache engine the hub runs on.
    pub fn engine(&self) -> &CacheEngine {
        &self.inner.engine
    }

    /// The orchestration tables.
    pub fn tables(&self) -> &TaskHubTables {
        &self.inner.tables
    }

    pub(crate) fn dispatch_queue(&self) -> &PartitionedWorkQueue<String, u64> {
        &self.inner.dispatch
    }

    fn start_for(&self, instance_id: &str) -> TxContext {
        let partition = self.inner.tables.instances.partition_of(instance_id);
        self.inner.engine.start_transaction(Some(partition))
    }

    fn next_sequence(&self) -> u64 {
        self.inner.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Store `message` in `tx` and dispatch it when `tx` commits.
    ///
    /// Messages reach the dispatch queue in commit order.
    pub fn stage_message(&self, tx: &mut TxContext, mut message: TaskMessage) -> Result<u64> {
        let sequence = self.next_sequence();
        message.sequence = sequence;
        let instance_id = message.instance_id.clone();
        self.inner.tables.messages.add(tx, message)?;

        let dispatch = self.inner.dispatch.clone();
        tx.on_committed(move |_| dispatch.enqueue(instance_id, sequence));
        Ok(sequence)
    }

    /// Store `activity` in `tx` and queue it when `tx` commits.
    pub fn stage_activity(&self, tx: &mut TxContext, mut activity: ActivityMessage) -> Result<u64> {
        let sequence = self.next_sequence();
        activity.sequence = sequence;
        self.inner.tables.activities.add(tx, activity)?;

        let activities = self.inner.activities.clone();
        tx.on_committed(move |_| activities.enqueue(sequence));
        Ok(sequence)
    }

    /// Start (or restart) an instance from an `ExecutionStarted` message.
    #[instrument(skip(self, start, dedupe_statuses), fields(instance_id = %start.instance_id))]
    pub async fn create_instance(
        &self,
        start: TaskMessage,
        dedupe_statuses: &[InstanceStatus],
    ) -> Result<CreationDecision> {
        let instance_id = start.instance_id.clone();
        let mut tx = self.start_for(&instance_id);

        // 1. Load what is known about the instance
        tx.prefetch(self.inner.tables.instances.table(), instance_id.clone())?;
        tx.prefetch(self.inner.tables.histories.table(), instance_id.clone())?;
        tx.complete_prefetches().await?;
        let existing = self.inner.tables.instances.get_state(&mut tx, &instance_id).await?;
        let history = self
            .inner
            .tables
            .histories
            .get_history(&mut tx, &instance_id)
            .await?;

        // 2. Decide
        let decision = handle_creation_request(existing.as_ref(), &start, dedupe_statuses)?;
        let CreationDecision::NewOrReplace(record) = &decision else {
            debug!(decision = ?decision, "Creation request deduplicated");
            return Ok(decision);
        };

        // 3. Replace state and drop the previous execution's history
        self.inner.tables.instances.set_state(&mut tx, record.clone())?;
        if history.is_some() {
            self.inner.tables.histories.delete(&mut tx, &instance_id)?;
        }
        self.stage_message(&mut tx, start.with_execution(record.execution_id.clone()))?;
        let transaction_id = tx.commit()?;

        info!(
            execution_id = %record.execution_id,
            replaced = existing.is_some(),
            transaction_id = %transaction_id,
            "Instance created"
        );
        Ok(decision)
    }

    /// Store messages for their target instances.
    pub fn send_messages(&self, messages: Vec<TaskMessage>) -> Result<TransactionId> {
        let mut tx = self.inner.engine.start_transaction(None);
        for message in messages {
            self.stage_message(&mut tx, message)?;
        }
        tx.commit()
    }

    /// Deliver a named external event to an instance.
    pub fn raise_event(
        &self,
        instance_id: &str,
        name: &str,
        input: Option<Value>,
    ) -> Result<TransactionId> {
        self.send_messages(vec![TaskMessage::new(
            instance_id,
            EventKind::EventRaised {
                name: name.to_string(),
                input,
            },
        )])
    }

    /// Stop an instance. Returns `false` if it had already finished.
    #[instrument(skip(self))]
    pub async fn terminate_instance(&self, instance_id: &str, reason: &str) -> Result<bool> {
        let mut tx = self.start_for(instance_id);
        let Some(mut record) = self.inner.tables.instances.get_state(&mut tx, instance_id).await?
        else {
            return Err(CacheError::UnknownInstance(instance_id.to_string()));
        };
        if record.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        record.status = InstanceStatus::Terminated;
        record.output = Some(Value::String(reason.to_string()));
        record.last_updated_at = now;
        record.completed_at = Some(now);
        let execution_id = record.execution_id.clone();
        self.inner.tables.instances.set_state(&mut tx, record)?;

        if let Some(history) = self
            .inner
            .tables
            .histories
            .get_history(&mut tx, instance_id)
            .await?
        {
            let event = HistoryEvent::new(
                history.len() as u64,
                EventKind::ExecutionTerminated {
                    reason: reason.to_string(),
                },
            );
            self.inner.tables.histories.append_events(
                &mut tx,
                instance_id,
                &execution_id,
                history.len(),
                vec![event],
            )?;
        }
        tx.commit()?;

        info!(reason = %reason, "Instance terminated");
        Ok(true)
    }

    /// Current record of an instance.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let mut tx = self.start_for(instance_id);
        self.inner.tables.instances.get_state(&mut tx, instance_id).await
    }

    /// History of an instance's current execution.
    pub async fn get_history(&self, instance_id: &str) -> Result<Option<History>> {
        let mut tx = self.start_for(instance_id);
        self.inner.tables.histories.get_history(&mut tx, instance_id).await
    }

    /// Load state and history of an instance with one prefetch batch.
    pub async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<(Option<InstanceRecord>, History)> {
        let mut tx = self.start_for(instance_id);
        tx.prefetch(self.inner.tables.instances.table(), instance_id.to_string())?;
        tx.prefetch(self.inner.tables.histories.table(), instance_id.to_string())?;
        tx.complete_prefetches().await?;

        let key = instance_id.to_string();
        let state = tx.try_get(self.inner.tables.instances.table(), &key)?;
        let history = tx
            .try_get(self.inner.tables.histories.table(), &key)?
            .unwrap_or_default();
        Ok((state, history))
    }

    /// Stored messages for `sequences`, skipping any already consumed.
    pub fn pending_messages(&self, sequences: &[u64]) -> Vec<TaskMessage> {
        let table = self.inner.tables.messages.table();
        sequences
            .iter()
            .filter_map(|sequence| table.cached(sequence).flatten())
            .collect()
    }

    /// Delete the stored messages among `sequences` that target `instance_id`.
    ///
    /// Returns how many were removed.
    #[instrument(skip(self, sequences), fields(messages = sequences.len()))]
    pub async fn purge_messages(&self, instance_id: &str, sequences: &[u64]) -> Result<usize> {
        let messages = &self.inner.tables.messages;
        let mut tx = self.start_for(instance_id);
        for sequence in sequences {
            tx.prefetch(messages.table(), *sequence)?;
        }
        tx.complete_prefetches().await?;

        let mut purged = 0;
        for sequence in sequences {
            match tx.try_get(messages.table(), sequence)? {
                Some(message) if message.instance_id == instance_id => {
                    messages.remove(&mut tx, *sequence)?;
                    purged += 1;
                }
                _ => {}
            }
        }
        if purged > 0 {
            tx.commit()?;
        }
        Ok(purged)
    }

    /// Wait for the next pending activity.
    pub async fn next_activity(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Dequeue<ActivityMessage> {
        let table = self.inner.tables.activities.table();
        loop {
            let sequence = match self.inner.activities.next(timeout, cancel).await {
                Dequeue::Item(sequence) => sequence,
                Dequeue::TimedOut => return Dequeue::TimedOut,
                Dequeue::Cancelled => return Dequeue::Cancelled,
            };
            if let Some(Some(activity)) = table.cached(&sequence) {
                return Dequeue::Item(activity);
            }
        }
    }

    /// Record an activity's result and notify the orchestration that scheduled it.
    #[instrument(skip(self, result))]
    pub async fn complete_activity(
        &self,
        sequence: u64,
        result: std::result::Result<Option<Value>, String>,
    ) -> Result<TransactionId> {
        let table = self.inner.tables.activities.table();
        let mut tx = self.inner.engine.start_transaction(None);
        let activity = tx.get(table, &sequence).await?.ok_or_else(|| {
            CacheError::InvalidMessage(format!("activity {} is not pending", sequence))
        })?;
        self.inner.tables.activities.remove(&mut tx, sequence)?;

        let kind = match result {
            Ok(result) => EventKind::TaskCompleted {
                task_scheduled_id: activity.task_scheduled_id,
                result,
            },
            Err(reason) => EventKind::TaskFailed {
                task_scheduled_id: activity.task_scheduled_id,
                reason,
            },
        };
        let message =
            TaskMessage::new(activity.instance_id, kind).with_execution(activity.execution_id);
        self.stage_message(&mut tx, message)?;
        tx.commit()
    }

    /// Fold an execution result into table state.
    ///
    /// `consumed` are the sequence numbers of the dispatched messages. Discarded and
    /// disconnected results change nothing and return `None`.
    #[instrument(skip(self, consumed, update), fields(update = update.kind()))]
    pub async fn apply_instance_update(
        &self,
        instance_id: &str,
        consumed: &[u64],
        update: InstanceUpdate,
    ) -> Result<Option<TransactionId>> {
        if !update.consumes_messages() {
            return Ok(None);
        }

        let tables = &self.inner.tables;
        let mut tx = self.start_for(instance_id);
        tx.prefetch(tables.instances.table(), instance_id.to_string())?;
        tx.prefetch(tables.histories.table(), instance_id.to_string())?;
        for sequence in consumed {
            tx.prefetch(tables.messages.table(), *sequence)?;
        }
        tx.complete_prefetches().await?;

        for sequence in consumed {
            if tx.try_get(tables.messages.table(), sequence)?.is_some() {
                tables.messages.remove(&mut tx, *sequence)?;
            }
        }
        let stored_state = tables.instances.get_state(&mut tx, instance_id).await?;
        let stored_history = tables.histories.get_history(&mut tx, instance_id).await?;

        let advances = matches!(
            update,
            InstanceUpdate::AppendHistoryEvents { .. } | InstanceUpdate::NewHistory { .. }
        );
        if let Some(record) = stored_state.as_ref().filter(|r| r.status.is_terminal()) {
            if advances {
                return Err(CacheError::InstanceFinished {
                    instance_id: instance_id.to_string(),
                    status: record.status.to_string(),
                });
            }
        }

        let outbound = match update {
            InstanceUpdate::AppendHistoryEvents {
                position,
                new_events,
                state,
                outbound,
            } => {
                tables.histories.append_events(
                    &mut tx,
                    instance_id,
                    &state.execution_id,
                    position,
                    new_events,
                )?;
                tables.instances.set_state(&mut tx, state)?;
                Some(outbound)
            }
            InstanceUpdate::NewHistory {
                history,
                state,
                outbound,
            } => {
                tables.histories.replace_history(&mut tx, instance_id, history)?;
                tables.instances.set_state(&mut tx, state)?;
                Some(outbound)
            }
            InstanceUpdate::DeleteInstance => {
                if stored_state.is_some() {
                    tables.instances.delete(&mut tx, instance_id)?;
                }
                if stored_history.is_some() {
                    tables.histories.delete(&mut tx, instance_id)?;
                }
                None
            }
            InstanceUpdate::DiscardMessages { .. } | InstanceUpdate::Disconnected { .. } => None,
        };

        if let Some(outbound) = outbound {
            for message in outbound.orchestrator {
                self.stage_message(&mut tx, message)?;
            }
            for activity in outbound.activities {
                self.stage_activity(&mut tx, activity)?;
            }
        }

        let transaction_id = tx.commit()?;
        debug!(
            consumed = consumed.len(),
            transaction_id = %transaction_id,
            "Instance update applied"
        );
        Ok(Some(transaction_id))
    }

    /// Current load, for scaling decisions.
    pub fn load_metrics(&self) -> LoadMetrics {
        let engine = &self.inner.engine;
        LoadMetrics {
            pending_dispatch_batches: self.inner.dispatch.ready_len(),
            in_flight_dispatches: self.inner.dispatch.in_flight_len(),
            pending_messages: self.inner.dispatch.pending_items(),
            pending_activities: self.inner.activities.len(),
            dirty_rows: engine.dirty_row_count(),
            unflushed_partitions: engine.unflushed_partitions(),
            partition_count: engine.partition_count(),
        }
    }
}
