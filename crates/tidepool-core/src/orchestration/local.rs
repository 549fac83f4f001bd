// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process instance connection.
//!
//! Execution workers in the same process pull [`OrchestrationWorkItem`]s from the
//! connection, run the orchestration code and report back an [`ExecutionOutcome`].
//! The connection keeps one cursor per instance with the history the worker last saw
//! and turns each outcome into an [`InstanceUpdate`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{ExecutionResult, InstanceConnection, InstanceUpdate, check_executable};
use super::types::{
    History, HistoryEvent, InstanceRecord, OutboundMessages, TaskMessage, is_entity_deletion,
};
use crate::cache::lock;
use crate::error::{CacheError, Result};
use crate::sync::{Dequeue, WorkItemQueue};

/// Everything an execution worker needs to run one instance step.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationWorkItem {
    pub instance_id: String,
    pub execution_id: Option<String>,
    pub state: Option<InstanceRecord>,
    /// Events the instance already recorded.
    pub history: Vec<HistoryEvent>,
    /// Messages to execute.
    pub new_messages: Vec<TaskMessage>,
}

/// What an execution worker reports when it finishes a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    /// Execution the outcome belongs to; differs from the work item after continue-as-new.
    pub execution_id: String,
    /// Events appended to the work item's history.
    pub new_events: Vec<HistoryEvent>,
    /// Complete history of `execution_id` after this step.
    pub new_history: Vec<HistoryEvent>,
    pub state: InstanceRecord,
    pub outbound: OutboundMessages,
}

struct ExecutionCursor {
    execution_id: Option<String>,
    events: Vec<HistoryEvent>,
    state: Option<InstanceRecord>,
    pending: Option<oneshot::Sender<ExecutionResult>>,
}

impl ExecutionCursor {
    fn classify(&mut self, outcome: ExecutionOutcome) -> InstanceUpdate {
        if is_entity_deletion(&outcome.new_history) {
            return InstanceUpdate::DeleteInstance;
        }

        let changed = self.execution_id.as_deref() != Some(outcome.execution_id.as_str());
        let update = if changed && outcome.new_events.is_empty() {
            InstanceUpdate::NewHistory {
                history: History {
                    execution_id: Some(outcome.execution_id.clone()),
                    events: outcome.new_history.clone(),
                },
                state: outcome.state.clone(),
                outbound: outcome.outbound,
            }
        } else {
            InstanceUpdate::AppendHistoryEvents {
                position: self.events.len(),
                new_events: outcome.new_events.clone(),
                state: outcome.state.clone(),
                outbound: outcome.outbound,
            }
        };

        if changed && outcome.new_events.is_empty() {
            self.events = outcome.new_history;
        } else {
            self.events.extend(outcome.new_events);
        }
        self.execution_id = Some(outcome.execution_id);
        self.state = Some(outcome.state);
        update
    }
}

/// Instance connection served by workers in the same process.
pub struct LocalInstanceConnection {
    cursors: Mutex<HashMap<String, ExecutionCursor>>,
    queue: WorkItemQueue<OrchestrationWorkItem>,
    closed: CancellationToken,
}

impl std::fmt::Debug for LocalInstanceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalInstanceConnection")
            .field("cursors", &lock(&self.cursors).len())
            .field("queued", &self.queue.len())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Default for LocalInstanceConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalInstanceConnection {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            queue: WorkItemQueue::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Number of instances with a cursor.
    pub fn cursor_count(&self) -> usize {
        lock(&self.cursors).len()
    }

    /// Work items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Wait for the next work item.
    ///
    /// Items whose execution was abandoned in the meantime are skipped.
    pub async fn next_work_item(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Dequeue<OrchestrationWorkItem> {
        loop {
            let item = match self.queue.next(timeout, cancel).await {
                Dequeue::Item(item) => item,
                other => return other,
            };
            let live = lock(&self.cursors)
                .get(&item.instance_id)
                .is_some_and(|cursor| cursor.pending.is_some());
            if live {
                return Dequeue::Item(item);
            }
            debug!(instance_id = %item.instance_id, "Skipping abandoned work item");
        }
    }

    /// Report the outcome of a work item and resolve the waiting dispatch.
    pub fn complete_work_item(&self, instance_id: &str, outcome: ExecutionOutcome) -> Result<()> {
        let mut cursors = lock(&self.cursors);
        let cursor = cursors
            .get_mut(instance_id)
            .ok_or_else(|| CacheError::UnknownInstance(instance_id.to_string()))?;
        let pending = cursor.pending.take().ok_or_else(|| {
            CacheError::InvalidMessage(format!("no execution pending for '{}'", instance_id))
        })?;

        let update = cursor.classify(outcome);
        if matches!(update, InstanceUpdate::DeleteInstance) {
            cursors.remove(instance_id);
        }
        drop(cursors);

        debug!(instance_id = %instance_id, update = update.kind(), "Work item completed");
        if pending.send(update).is_err() {
            warn!(instance_id = %instance_id, "Dispatch stopped waiting before completion");
        }
        Ok(())
    }

    /// Give up on a work item; the dispatch resolves as disconnected.
    pub fn abandon_work_item(&self, instance_id: &str, reason: &str) -> Result<()> {
        let cursor = lock(&self.cursors)
            .remove(instance_id)
            .ok_or_else(|| CacheError::UnknownInstance(instance_id.to_string()))?;
        if let Some(pending) = cursor.pending {
            let _ = pending.send(InstanceUpdate::Disconnected {
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    async fn dispatch(&self, instance_id: &str, messages: Vec<TaskMessage>) -> ExecutionResult {
        let (sender, receiver) = oneshot::channel();
        let item = {
            let mut cursors = lock(&self.cursors);
            let Some(cursor) = cursors.get_mut(instance_id) else {
                return InstanceUpdate::Disconnected {
                    reason: format!("no cursor for '{}'", instance_id),
                };
            };
            if cursor.pending.is_some() {
                return InstanceUpdate::Disconnected {
                    reason: format!("instance '{}' is already executing", instance_id),
                };
            }
            if let Err(reason) = check_executable(
                instance_id,
                cursor.state.as_ref(),
                &History {
                    execution_id: cursor.execution_id.clone(),
                    events: cursor.events.clone(),
                },
                &messages,
            ) {
                return InstanceUpdate::DiscardMessages { reason };
            }
            cursor.pending = Some(sender);
            OrchestrationWorkItem {
                instance_id: instance_id.to_string(),
                execution_id: cursor.execution_id.clone(),
                state: cursor.state.clone(),
                history: cursor.events.clone(),
                new_messages: messages,
            }
        };
        self.queue.enqueue(item);

        tokio::select! {
            result = receiver => result.unwrap_or_else(|_| InstanceUpdate::Disconnected {
                reason: "execution abandoned".to_string(),
            }),
            _ = self.closed.cancelled() => InstanceUpdate::Disconnected {
                reason: "connection closed".to_string(),
            },
        }
    }
}

#[async_trait]
impl InstanceConnection for LocalInstanceConnection {
    async fn process_history_and_messages(
        &self,
        instance_id: &str,
        state: Option<InstanceRecord>,
        history: History,
        messages: Vec<TaskMessage>,
    ) -> ExecutionResult {
        if self.closed.is_cancelled() {
            return InstanceUpdate::Disconnected {
                reason: "connection closed".to_string(),
            };
        }
        {
            let mut cursors = lock(&self.cursors);
            if cursors
                .get(instance_id)
                .is_some_and(|cursor| cursor.pending.is_some())
            {
                return InstanceUpdate::Disconnected {
                    reason: format!("instance '{}' is already executing", instance_id),
                };
            }
            let execution_id = history
                .execution_id
                .or_else(|| state.as_ref().map(|s| s.execution_id.clone()));
            cursors.insert(
                instance_id.to_string(),
                ExecutionCursor {
                    execution_id,
                    events: history.events,
                    state,
                    pending: None,
                },
            );
        }
        self.dispatch(instance_id, messages).await
    }

    async fn process_messages(
        &self,
        instance_id: &str,
        messages: Vec<TaskMessage>,
    ) -> ExecutionResult {
        if self.closed.is_cancelled() {
            return InstanceUpdate::Disconnected {
                reason: "connection closed".to_string(),
            };
        }
        self.dispatch(instance_id, messages).await
    }

    fn is_connected(&self, instance_id: &str) -> bool {
        lock(&self.cursors).contains_key(instance_id)
    }

    async fn close(&self, reason: &str) {
        self.closed.cancel();
        let cursors: Vec<ExecutionCursor> =
            lock(&self.cursors).drain().map(|(_, cursor)| cursor).collect();
        for pending in cursors.into_iter().filter_map(|cursor| cursor.pending) {
            let _ = pending.send(InstanceUpdate::Disconnected {
                reason: reason.to_string(),
            });
        }
        let dropped = self.queue.drain().len();
        debug!(reason = %reason, dropped, "Local instance connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::types::{ENTITY_DELETE_MARKER, EventKind};
    use crate::orchestration::InstanceStatus;
    use chrono::Utc;
    use std::sync::Arc;

    fn record(instance_id: &str, execution_id: &str) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: instance_id.to_string(),
            execution_id: execution_id.to_string(),
            name: "Flow".to_string(),
            version: None,
            status: InstanceStatus::Running,
            input: None,
            output: None,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
        }
    }

    fn start() -> TaskMessage {
        TaskMessage::new(
            "order-1",
            EventKind::ExecutionStarted {
                name: "Flow".to_string(),
                version: None,
                input: None,
            },
        )
    }

    fn event(id: u64, kind: EventKind) -> HistoryEvent {
        HistoryEvent::new(id, kind)
    }

    async fn next(connection: &LocalInstanceConnection) -> OrchestrationWorkItem {
        connection
            .next_work_item(Some(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .into_item()
            .unwrap()
    }

    #[tokio::test]
    async fn test_discard_without_start_event() {
        let connection = LocalInstanceConnection::new();
        let raised = TaskMessage::new(
            "order-1",
            EventKind::EventRaised {
                name: "approve".to_string(),
                input: None,
            },
        );

        let result = connection
            .process_history_and_messages("order-1", None, History::default(), vec![raised])
            .await;

        match result {
            InstanceUpdate::DiscardMessages { reason } => assert!(!reason.is_empty()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(connection.queue.is_empty());
    }

    #[tokio::test]
    async fn test_completion_appends_at_prior_length() {
        let connection = Arc::new(LocalInstanceConnection::new());

        let dispatch = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .process_history_and_messages(
                        "order-1",
                        Some(record("order-1", "e1")),
                        History::default(),
                        vec![start()],
                    )
                    .await
            }
        });

        let item = next(&connection).await;
        assert_eq!(item.execution_id.as_deref(), Some("e1"));
        assert_eq!(item.new_messages.len(), 1);

        let events = vec![
            event(0, EventKind::OrchestratorStarted),
            start().event,
            event(2, EventKind::OrchestratorCompleted),
        ];
        connection
            .complete_work_item(
                "order-1",
                ExecutionOutcome {
                    execution_id: "e1".to_string(),
                    new_events: events.clone(),
                    new_history: events.clone(),
                    state: record("order-1", "e1"),
                    outbound: OutboundMessages::default(),
                },
            )
            .unwrap();

        match dispatch.await.unwrap() {
            InstanceUpdate::AppendHistoryEvents {
                position,
                new_events,
                ..
            } => {
                assert_eq!(position, 0);
                assert_eq!(new_events.len(), 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Second step continues from the cursor.
        let dispatch = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .process_messages(
                        "order-1",
                        vec![TaskMessage::new(
                            "order-1",
                            EventKind::EventRaised {
                                name: "approve".to_string(),
                                input: None,
                            },
                        )],
                    )
                    .await
            }
        });
        let item = next(&connection).await;
        assert_eq!(item.history.len(), 3);
        let more = vec![event(3, EventKind::OrchestratorStarted)];
        let mut history = events.clone();
        history.extend(more.clone());
        connection
            .complete_work_item(
                "order-1",
                ExecutionOutcome {
                    execution_id: "e1".to_string(),
                    new_events: more,
                    new_history: history,
                    state: record("order-1", "e1"),
                    outbound: OutboundMessages::default(),
                },
            )
            .unwrap();
        assert!(matches!(
            dispatch.await.unwrap(),
            InstanceUpdate::AppendHistoryEvents { position: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_continue_as_new_yields_new_history() {
        let connection = Arc::new(LocalInstanceConnection::new());
        let history = History {
            execution_id: Some("e1".to_string()),
            events: vec![start().event],
        };

        let dispatch = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .process_history_and_messages(
                        "order-1",
                        Some(record("order-1", "e1")),
                        history,
                        vec![TaskMessage::new(
                            "order-1",
                            EventKind::TimerFired {
                                timer_id: 1,
                                fire_at: Utc::now(),
                            },
                        )],
                    )
                    .await
            }
        });

        next(&connection).await;
        let fresh = vec![event(0, EventKind::OrchestratorStarted), start().event];
        connection
            .complete_work_item(
                "order-1",
                ExecutionOutcome {
                    execution_id: "e2".to_string(),
                    new_events: Vec::new(),
                    new_history: fresh.clone(),
                    state: record("order-1", "e2"),
                    outbound: OutboundMessages::default(),
                },
            )
            .unwrap();

        match dispatch.await.unwrap() {
            InstanceUpdate::NewHistory { history, state, .. } => {
                assert_eq!(history.execution_id.as_deref(), Some("e2"));
                assert_eq!(history.events, fresh);
                assert_eq!(state.execution_id, "e2");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_entity_deletion_yields_delete_instance() {
        let connection = Arc::new(LocalInstanceConnection::new());
        let id = "@counter@a";

        let dispatch = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .process_history_and_messages(
                        id,
                        None,
                        History::default(),
                        vec![TaskMessage::new(
                            id,
                            EventKind::EventRaised {
                                name: "delete".to_string(),
                                input: None,
                            },
                        )],
                    )
                    .await
            }
        });

        next(&connection).await;
        let marker = vec![
            event(0, EventKind::OrchestratorStarted),
            event(
                1,
                EventKind::ExecutionStarted {
                    name: ENTITY_DELETE_MARKER.to_string(),
                    version: None,
                    input: None,
                },
            ),
            event(2, EventKind::OrchestratorCompleted),
        ];
        connection
            .complete_work_item(
                id,
                ExecutionOutcome {
                    execution_id: "e1".to_string(),
                    new_events: marker.clone(),
                    new_history: marker,
                    state: record(id, "e1"),
                    outbound: OutboundMessages::default(),
                },
            )
            .unwrap();

        assert_eq!(dispatch.await.unwrap(), InstanceUpdate::DeleteInstance);
        assert!(!connection.is_connected(id));
    }

    #[tokio::test]
    async fn test_abandon_and_close_resolve_as_disconnected() {
        let connection = Arc::new(LocalInstanceConnection::new());

        let dispatch = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .process_history_and_messages(
                        "order-1",
                        Some(record("order-1", "e1")),
                        History::default(),
                        vec![start()],
                    )
                    .await
            }
        });
        next(&connection).await;
        connection.abandon_work_item("order-1", "worker crashed").unwrap();
        assert_eq!(
            dispatch.await.unwrap(),
            InstanceUpdate::Disconnected {
                reason: "worker crashed".to_string()
            }
        );
        assert!(!connection.is_connected("order-1"));

        let dispatch = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .process_history_and_messages(
                        "order-1",
                        Some(record("order-1", "e1")),
                        History::default(),
                        vec![start()],
                    )
                    .await
            }
        });
        while connection.queued() == 0 {
            tokio::task::yield_now().await;
        }
        connection.close("shutting down").await;
        assert!(matches!(
            dispatch.await.unwrap(),
            InstanceUpdate::Disconnected { .. }
        ));
        assert_eq!(connection.cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_without_pending_execution_fails() {
        let connection = LocalInstanceConnection::new();
        let outcome = ExecutionOutcome {
            execution_id: "e1".to_string(),
            new_events: Vec::new(),
            new_history: Vec::new(),
            state: record("order-1", "e1"),
            outbound: OutboundMessages::default(),
        };
        let err = connection.complete_work_item("order-1", outcome).unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_INSTANCE");
    }
}
