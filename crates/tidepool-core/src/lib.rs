// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tidepool Core - Durable Orchestration State
//!
//! This crate keeps the state of long-running, replayable orchestrations (instance
//! records, histories, pending messages and activities) in an in-memory,
//! transactionally consistent row cache. Committed changes are flushed to a
//! relational store as batched checkpoints, and newly visible messages are routed
//! to an orchestration execution engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Clients                                    │
//! │        create_instance / raise_event / terminate / complete_activity    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               TaskHub                                   │
//! │          Instances · Histories · Messages · Activities tables           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ TxContext::commit                        │ on_committed
//!           ▼                                          ▼
//! ┌───────────────────────┐                ┌─────────────────────────────┐
//! │     CacheEngine       │                │      WorkItemPipeline       │
//! │ partitions, dirty     │                │  PartitionedWorkQueue ──►   │
//! │ markers, listeners    │                │  InstanceConnection         │
//! └───────────────────────┘                └─────────────────────────────┘
//!           │ completion listeners                     │
//!           ▼                                          ▼
//! ┌───────────────────────┐                ┌─────────────────────────────┐
//! │   CheckpointWorker    │                │     Execution workers       │
//! │ collect → write →     │                │  (LocalInstanceConnection)  │
//! │ post-persist          │                └─────────────────────────────┘
//! └───────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │ PostgreSQL / SQLite   │
//! │  (CheckpointStore)    │
//! └───────────────────────┘
//! ```
//!
//! # Durability Milestones
//!
//! | Milestone | Callback | Meaning |
//! |-----------|----------|---------|
//! | Committed | `TxContext::on_committed` | Sequenced; runs in transaction id order before the commit lock is released |
//! | Applied | `TxContext::on_applied` | Merged into the shared cache, visible to other transactions |
//! | Persisted | `TxContext::on_persisted` | The checkpoint holding the transaction was written |
//!
//! `TxContext::commit` returns as soon as the transaction is applied; durability is
//! reported later through the persisted callbacks.
//!
//! # Instance Updates
//!
//! | Variant | Effect |
//! |---------|--------|
//! | `AppendHistoryEvents` | Append new events at the prior event count, replace state |
//! | `NewHistory` | Replace the history (continue-as-new), replace state |
//! | `DiscardMessages` | Nothing changes; the instance cannot run these messages |
//! | `Disconnected` | Nothing changes; the batch is retried |
//! | `DeleteInstance` | Remove state and history |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TIDEPOOL_DATABASE_URL` | Yes | - | `sqlite:` path or PostgreSQL connection string |
//! | `TIDEPOOL_PARTITION_COUNT` | No | `12` | Engine partitions |
//! | `TIDEPOOL_LOCK_TIMEOUT_SECS` | No | `30` | Store lock timeout |
//! | `TIDEPOOL_APP_NAME` | No | `tidepool` | Identity recorded with each checkpoint |
//! | `TIDEPOOL_CHECKPOINT_DELAY_MS` | No | `10` | Checkpoint coalescing delay |
//!
//! # Modules
//!
//! - [`cache`]: Transactional row cache, checkpoint commands and the checkpoint worker
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`orchestration`]: Task hub tables, instance connections and the work-item pipeline
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`scale`]: Load metrics for autoscaling
//! - [`store`]: Durable checkpoint stores
//! - [`sync`]: Async queues and signals

/// Transactional row cache with checkpoint write-back.
pub mod cache;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Orchestration tables, creation rules, instance connections and dispatch.
pub mod orchestration;

/// Embeddable runtime.
pub mod runtime;

/// Load metrics for external autoscalers.
pub mod scale;

/// Durable checkpoint stores (memory, SQLite, PostgreSQL).
pub mod store;

/// Async queues and signals.
pub mod sync;

pub use cache::{CacheConfig, CacheEngine, CheckpointCommand, TransactionId, TxContext};
pub use error::{CacheError, Result};
pub use orchestration::{InstanceConnection, InstanceUpdate, TaskHub};
pub use runtime::TaskHubRuntime;
