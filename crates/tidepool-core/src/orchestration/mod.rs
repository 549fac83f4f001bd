// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable orchestration state on top of the cache engine.
//!
//! ```text
//!  client ──► TaskHub ──(tx commit)──► Messages table
//!                                          │ on_committed
//!                                          ▼
//!                               PartitionedWorkQueue (per instance)
//!                                          │
//!                                          ▼
//!  WorkItemPipeline ──► InstanceConnection ──► execution worker
//!         ▲                    │
//!         └── InstanceUpdate ◄─┘
//! ```

mod connection;
mod creation;
mod hub;
mod local;
mod pipeline;
mod tables;
mod types;

pub use self::connection::{ExecutionResult, InstanceConnection, InstanceUpdate, check_executable};
pub use self::creation::{CreationDecision, handle_creation_request};
pub use self::hub::TaskHub;
pub use self::local::{ExecutionOutcome, LocalInstanceConnection, OrchestrationWorkItem};
pub use self::pipeline::{PipelineConfig, WorkItemPipeline};
pub use self::tables::{
    ACTIVITIES, ActivitiesTable, HISTORIES, HistoriesTable, INSTANCES, InstancesTable, MESSAGES,
    MessagesTable, TaskHubTables,
};
pub use self::types::{
    ActivityMessage, ENTITY_DELETE_MARKER, EventKind, History, HistoryEvent, InstanceRecord,
    InstanceStatus, OutboundMessages, TaskMessage, entity_name, is_entity, is_entity_deletion,
};
