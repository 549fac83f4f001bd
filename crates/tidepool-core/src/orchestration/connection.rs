// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The boundary between the task hub and an orchestration execution engine.

use async_trait::async_trait;

use super::types::{
    EventKind, History, HistoryEvent, InstanceRecord, OutboundMessages, TaskMessage, entity_name,
    is_entity,
};

/// How one execution outcome is folded back into table state.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceUpdate {
    /// The history grew by `new_events`, inserted at `position`.
    AppendHistoryEvents {
        position: usize,
        new_events: Vec<HistoryEvent>,
        state: InstanceRecord,
        outbound: OutboundMessages,
    },
    /// The execution identity changed; `history` replaces the stored one.
    NewHistory {
        history: History,
        state: InstanceRecord,
        outbound: OutboundMessages,
    },
    /// The instance cannot execute these messages. Nothing changes.
    DiscardMessages { reason: String },
    /// The execution engine went away. Nothing changes; the batch is retried.
    Disconnected { reason: String },
    /// The instance removed itself.
    DeleteInstance,
}

/// Result of dispatching a work item.
pub type ExecutionResult = InstanceUpdate;

impl InstanceUpdate {
    /// Variant name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AppendHistoryEvents { .. } => "append_history_events",
            Self::NewHistory { .. } => "new_history",
            Self::DiscardMessages { .. } => "discard_messages",
            Self::Disconnected { .. } => "disconnected",
            Self::DeleteInstance => "delete_instance",
        }
    }

    /// Whether the update consumes the dispatched messages.
    pub fn consumes_messages(&self) -> bool {
        !matches!(self, Self::DiscardMessages { .. } | Self::Disconnected { .. })
    }
}

/// A connection to an orchestration execution engine.
///
/// Implementations report execution failures through [`InstanceUpdate::Disconnected`]
/// and [`InstanceUpdate::DiscardMessages`] rather than errors.
#[async_trait]
pub trait InstanceConnection: Send + Sync {
    /// First contact with an instance: hand over its stored state and history with the batch.
    async fn process_history_and_messages(
        &self,
        instance_id: &str,
        state: Option<InstanceRecord>,
        history: History,
        messages: Vec<TaskMessage>,
    ) -> ExecutionResult;

    /// Forward a batch to an instance this connection already holds a cursor for.
    async fn process_messages(&self, instance_id: &str, messages: Vec<TaskMessage>)
    -> ExecutionResult;

    /// Whether the connection holds a cursor for `instance_id`.
    fn is_connected(&self, instance_id: &str) -> bool;

    /// Release every cursor; pending executions resolve as disconnected.
    async fn close(&self, reason: &str);
}

/// Whether `messages` may be executed against an instance in this state.
///
/// Returns the reason on rejection.
pub fn check_executable(
    instance_id: &str,
    state: Option<&InstanceRecord>,
    history: &History,
    messages: &[TaskMessage],
) -> Result<(), String> {
    let started = history.has_start_event();
    let starts_now = messages.iter().any(|m| m.event.is_execution_started());
    let auto_start = is_entity(instance_id)
        && messages
            .iter()
            .any(|m| matches!(m.event.kind, EventKind::EventRaised { .. }));

    if !started && !starts_now && !auto_start {
        return Err(format!(
            "instance '{}' does not exist and no message starts it",
            instance_id
        ));
    }

    if let Some(expected) = entity_name(instance_id) {
        let mismatched = messages.iter().find_map(|m| match &m.event.kind {
            EventKind::ExecutionStarted { name, .. }
                if !name.starts_with('@') && name.to_lowercase() != expected =>
            {
                Some(name.clone())
            }
            _ => None,
        });
        if let Some(name) = mismatched {
            return Err(format!(
                "entity '{}' cannot be started as '{}'",
                instance_id, name
            ));
        }
    }

    // A final status also rejects an instance terminated before its first step.
    match state {
        Some(record)
            if (started && !record.status.accepts_work()) || record.status.is_terminal() =>
        {
            return Err(format!(
                "instance '{}' is {} and accepts no messages",
                instance_id, record.status
            ));
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::InstanceStatus;
    use chrono::Utc;

    fn raised() -> TaskMessage {
        TaskMessage::new(
            "x",
            EventKind::EventRaised {
                name: "ping".to_string(),
                input: None,
            },
        )
    }

    fn started(name: &str) -> TaskMessage {
        TaskMessage::new(
            "x",
            EventKind::ExecutionStarted {
                name: name.to_string(),
                version: None,
                input: None,
            },
        )
    }

    fn started_history() -> History {
        History {
            execution_id: Some("e1".to_string()),
            events: vec![started("Flow").event],
        }
    }

    fn record(status: InstanceStatus) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: "order-1".to_string(),
            execution_id: "e1".to_string(),
            name: "Flow".to_string(),
            version: None,
            status,
            input: None,
            output: None,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_unstarted_instance_is_rejected() {
        let reason =
            check_executable("order-1", None, &History::default(), &[raised()]).unwrap_err();
        assert!(reason.contains("does not exist"));
    }

    #[test]
    fn test_start_message_makes_instance_executable() {
        assert!(check_executable("order-1", None, &History::default(), &[started("Flow")]).is_ok());
    }

    #[test]
    fn test_entity_auto_starts_on_event() {
        assert!(check_executable("@counter@a", None, &History::default(), &[raised()]).is_ok());
    }

    #[test]
    fn test_entity_type_mismatch() {
        let reason = check_executable(
            "@counter@a",
            None,
            &History::default(),
            &[started("Inventory")],
        )
        .unwrap_err();
        assert!(reason.contains("Inventory"));

        assert!(
            check_executable("@counter@a", None, &History::default(), &[started("Counter")])
                .is_ok()
        );
    }

    #[test]
    fn test_status_gate() {
        let history = started_history();
        for status in [InstanceStatus::Pending, InstanceStatus::Running] {
            let state = record(status);
            assert!(check_executable("order-1", Some(&state), &history, &[raised()]).is_ok());
        }
        for status in [
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Terminated,
            InstanceStatus::Suspended,
        ] {
            let reason =
                check_executable("order-1", Some(&record(status)), &history, &[raised()])
                    .unwrap_err();
            assert!(reason.contains(status.as_str()));
        }
    }

    #[test]
    fn test_start_event_does_not_reopen_finished_instance() {
        let history = started_history();
        let reason = check_executable(
            "order-1",
            Some(&record(InstanceStatus::Completed)),
            &history,
            &[started("Flow")],
        )
        .unwrap_err();
        assert!(reason.contains("completed"));

        assert!(
            check_executable(
                "order-1",
                Some(&record(InstanceStatus::Running)),
                &history,
                &[started("Flow")],
            )
            .is_ok()
        );
    }

    #[test]
    fn test_terminated_before_first_step_is_rejected() {
        let reason = check_executable(
            "order-1",
            Some(&record(InstanceStatus::Terminated)),
            &History::default(),
            &[started("Flow")],
        )
        .unwrap_err();
        assert!(reason.contains("terminated"));

        // A freshly created instance still starts
        assert!(
            check_executable(
                "order-1",
                Some(&record(InstanceStatus::Pending)),
                &History::default(),
                &[started("Flow")],
            )
            .is_ok()
        );
    }

    #[test]
    fn test_update_consumes_messages() {
        assert!(InstanceUpdate::DeleteInstance.consumes_messages());
        assert!(
            !InstanceUpdate::Disconnected {
                reason: "gone".to_string()
            }
            .consumes_messages()
        );
        assert_eq!(
            InstanceUpdate::DiscardMessages {
                reason: String::new()
            }
            .kind(),
            "discard_messages"
        );
    }
}
