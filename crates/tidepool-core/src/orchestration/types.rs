// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration records stored in the task hub tables.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the `ExecutionStarted` event that marks an entity for deletion.
pub const ENTITY_DELETE_MARKER: &str = "@delete";

/// Lifecycle status of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, waiting for its first execution.
    Pending,
    /// Has executed at least once and is not finished.
    Running,
    /// Finished successfully.
    Completed,
    /// Restarted itself with a new execution.
    ContinuedAsNew,
    /// Finished with an error.
    Failed,
    /// Canceled before finishing.
    Canceled,
    /// Stopped by a terminate request.
    Terminated,
    /// Paused on request.
    Suspended,
}

impl InstanceStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::ContinuedAsNew => "continued_as_new",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Terminated => "terminated",
            Self::Suspended => "suspended",
        }
    }

    /// Whether new messages may still be executed.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the instance reached a final status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Terminated
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata row of one orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    /// Identity of the current generation; changes on continue-as-new.
    pub execution_id: String,
    pub name: String,
    pub version: Option<String>,
    pub status: InstanceStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What happened in one history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    OrchestratorStarted,
    OrchestratorCompleted,
    ExecutionStarted {
        name: String,
        version: Option<String>,
        input: Option<Value>,
    },
    ExecutionCompleted {
        status: InstanceStatus,
        output: Option<Value>,
    },
    ExecutionTerminated {
        reason: String,
    },
    EventRaised {
        name: String,
        input: Option<Value>,
    },
    TaskScheduled {
        name: String,
        input: Option<Value>,
    },
    TaskCompleted {
        task_scheduled_id: u64,
        result: Option<Value>,
    },
    TaskFailed {
        task_scheduled_id: u64,
        reason: String,
    },
    TimerCreated {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: u64,
        fire_at: DateTime<Utc>,
    },
}

/// One entry of an instance's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl HistoryEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Whether this is the start event of an execution.
    pub fn is_execution_started(&self) -> bool {
        matches!(self.kind, EventKind::ExecutionStarted { .. })
    }
}

/// Event log of the current execution of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Execution the events belong to; `None` for an empty history.
    pub execution_id: Option<String>,
    pub events: Vec<HistoryEvent>,
}

impl History {
    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether the history already contains a start event.
    pub fn has_start_event(&self) -> bool {
        self.events.iter().any(HistoryEvent::is_execution_started)
    }
}

/// A pending message addressed to an orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub instance_id: String,
    /// Execution the message targets; `None` addresses whichever is current.
    pub execution_id: Option<String>,
    pub event: HistoryEvent,
    /// Sequence number assigned when the message is stored; 0 before that.
    #[serde(default)]
    pub sequence: u64,
}

impl TaskMessage {
    /// Create an unsent message.
    pub fn new(instance_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: None,
            event: HistoryEvent::new(0, kind),
            sequence: 0,
        }
    }

    /// Address a specific execution.
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// A pending activity invocation scheduled by an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityMessage {
    pub instance_id: String,
    pub execution_id: String,
    /// Event id of the `TaskScheduled` event in the orchestration history.
    pub task_scheduled_id: u64,
    pub name: String,
    pub input: Option<Value>,
    #[serde(default)]
    pub sequence: u64,
}

/// Messages an execution emits besides its own history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessages {
    /// Messages for other (or the same) orchestration instances.
    pub orchestrator: Vec<TaskMessage>,
    /// Activities to run.
    pub activities: Vec<ActivityMessage>,
}

impl OutboundMessages {
    /// Whether nothing is sent.
    pub fn is_empty(&self) -> bool {
        self.orchestrator.is_empty() && self.activities.is_empty()
    }
}

/// Whether an instance id names an entity.
pub fn is_entity(instance_id: &str) -> bool {
    instance_id.starts_with('@')
}

/// Entity name of an `@name@key` id, lowercased.
pub fn entity_name(instance_id: &str) -> Option<String> {
    let rest = instance_id.strip_prefix('@')?;
    let (name, _key) = rest.split_once('@')?;
    Some(name.to_lowercase())
}

/// Whether `events` is exactly the history an entity leaves when it deletes itself.
pub fn is_entity_deletion(events: &[HistoryEvent]) -> bool {
    match events {
        [started, marker, completed] => {
            matches!(started.kind, EventKind::OrchestratorStarted)
                && matches!(
                    &marker.kind,
                    EventKind::ExecutionStarted { name, input: None, .. } if name == ENTITY_DELETE_MARKER
                )
                && matches!(completed.kind, EventKind::OrchestratorCompleted)
        }
        _ => false,
    }
}
