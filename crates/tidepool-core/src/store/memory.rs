// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store, used by tests and single-process embeddings.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{CheckpointStore, RecoveredState, StoredRow};
use crate::cache::{
    CheckpointCommand, CheckpointId, PartitionId, PartitionMetaData, WriteBack, lock,
};
use crate::error::{CacheError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<(String, String), (PartitionId, serde_json::Value)>,
    partitions: BTreeMap<PartitionId, PartitionMetaData>,
    checkpoints: Vec<CheckpointId>,
    failures_remaining: usize,
    failed_writes: usize,
}

/// Store that keeps checkpointed rows in memory.
///
/// [`fail_next_writes`](Self::fail_next_writes) makes the next writes fail with a
/// transient store error without touching the stored state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `write_checkpoint`.
    pub fn fail_next_writes(&self, count: usize) {
        lock(&self.state).failures_remaining = count;
    }

    /// Number of writes rejected through failure injection.
    pub fn failed_writes(&self) -> usize {
        lock(&self.state).failed_writes
    }

    /// Ids of the checkpoints written so far, in write order.
    pub fn written_checkpoints(&self) -> Vec<CheckpointId> {
        lock(&self.state).checkpoints.clone()
    }

    /// Stored value of a row, looked up by its JSON-encoded key.
    pub fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        lock(&self.state)
            .rows
            .get(&(table.to_string(), key.to_string()))
            .map(|(_, value)| value.clone())
    }

    /// Number of stored rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.state)
            .rows
            .keys()
            .filter(|(name, _)| name == table)
            .count()
    }

    /// Seed a row as if an earlier run had checkpointed it.
    pub fn insert_row(
        &self,
        table: &str,
        partition: PartitionId,
        key: &str,
        value: serde_json::Value,
    ) {
        lock(&self.state)
            .rows
            .insert((table.to_string(), key.to_string()), (partition, value));
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn write_checkpoint(&self, command: &CheckpointCommand) -> Result<()> {
        let checkpoint_id = command
            .checkpoint_id()
            .ok_or_else(|| CacheError::Internal("checkpoint command was never collected".into()))?;

        let mut state = lock(&self.state);
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            state.failed_writes += 1;
            return Err(CacheError::store(
                "write_checkpoint",
                format!("injected failure for checkpoint {}", checkpoint_id),
            ));
        }

        for delta in command.deltas() {
            let id = (delta.table.clone(), delta.key.clone());
            match (delta.write_back, &delta.value) {
                (WriteBack::Created | WriteBack::Updated, Some(value)) => {
                    state.rows.insert(id, (delta.partition, value.clone()));
                }
                _ => {
                    state.rows.remove(&id);
                }
            }
        }
        for meta in command.partitions() {
            state.partitions.insert(meta.partition_id, meta.clone());
        }
        if state.checkpoints.last() != Some(&checkpoint_id) {
            state.checkpoints.push(checkpoint_id);
        }

        debug!(
            checkpoint_id = %checkpoint_id,
            rows = command.row_count(),
            "Checkpoint written to memory store"
        );
        Ok(())
    }

    async fn load_row(
        &self,
        table: &str,
        _partition: PartitionId,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self.row(table, key))
    }

    async fn scan_table(&self, table: &str) -> Result<Vec<StoredRow>> {
        Ok(lock(&self.state)
            .rows
            .iter()
            .filter(|((name, _), _)| name == table)
            .map(|((_, key), (partition, value))| StoredRow {
                partition: *partition,
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn recover(&self) -> Result<RecoveredState> {
        let state = lock(&self.state);
        Ok(RecoveredState {
            last_checkpoint_id: state.checkpoints.iter().max().copied(),
            partitions: state.partitions.values().cloned().collect(),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
