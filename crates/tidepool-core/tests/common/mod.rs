// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tidepool-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tidepool_core::cache::{CacheConfig, CacheEngine};
use tidepool_core::orchestration::{
    EventKind, ExecutionOutcome, HistoryEvent, InstanceRecord, InstanceStatus,
    LocalInstanceConnection, OrchestrationWorkItem, OutboundMessages, TaskMessage,
};
use tidepool_core::store::{CheckpointStore, MemoryStore};

/// Install a test-writer subscriber once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("tidepool_core=debug")
        .try_init();
}

/// Engine over a fresh in-memory store.
pub fn memory_engine(partition_count: u32) -> (CacheEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = CacheEngine::new(CacheConfig { partition_count }, store.clone());
    (engine, store)
}

/// Engine that resumes from `store`.
pub async fn reopen(store: Arc<dyn CheckpointStore>, partition_count: u32) -> CacheEngine {
    CacheEngine::open(CacheConfig { partition_count }, store)
        .await
        .expect("Failed to open engine")
}

pub fn start_message(instance_id: &str, name: &str, input: Option<Value>) -> TaskMessage {
    TaskMessage::new(
        instance_id,
        EventKind::ExecutionStarted {
            name: name.to_string(),
            version: None,
            input,
        },
    )
}

pub fn raised_message(instance_id: &str, name: &str) -> TaskMessage {
    TaskMessage::new(
        instance_id,
        EventKind::EventRaised {
            name: name.to_string(),
            input: None,
        },
    )
}

/// Wait for the next work item on a local connection, failing after five seconds.
pub async fn next_work_item(connection: &LocalInstanceConnection) -> OrchestrationWorkItem {
    connection
        .next_work_item(Some(Duration::from_secs(5)), &CancellationToken::new())
        .await
        .into_item()
        .expect("No work item within 5s")
}

/// Outcome that records one orchestrator step on top of `item`.
pub fn step_outcome(item: &OrchestrationWorkItem, status: InstanceStatus) -> ExecutionOutcome {
    let execution_id = item
        .execution_id
        .clone()
        .expect("work item without execution id");
    let base = item.history.len() as u64;

    let mut new_events = vec![HistoryEvent::new(base, EventKind::OrchestratorStarted)];
    for (offset, message) in item.new_messages.iter().enumerate() {
        let mut event = message.event.clone();
        event.event_id = base + 1 + offset as u64;
        new_events.push(event);
    }
    new_events.push(HistoryEvent::new(
        base + 1 + item.new_messages.len() as u64,
        EventKind::OrchestratorCompleted,
    ));

    let mut new_history = item.history.clone();
    new_history.extend(new_events.clone());

    ExecutionOutcome {
        execution_id,
        new_events,
        new_history,
        state: record_for(item, status),
        outbound: OutboundMessages::default(),
    }
}

/// The work item's instance record with a new status.
pub fn record_for(item: &OrchestrationWorkItem, status: InstanceStatus) -> InstanceRecord {
    let now = Utc::now();
    let mut record = item.state.clone().expect("work item without state");
    record.status = status;
    record.last_updated_at = now;
    if status.is_terminal() {
        record.completed_at = Some(now);
    }
    record
}

/// Poll `check` until it holds, failing after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
