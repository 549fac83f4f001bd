// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoint commands: the write side of the cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CheckpointId, PartitionId, TransactionId, WriteBack};
use crate::error::{CacheError, Result};
use crate::store::CheckpointStore;

/// Per-partition checkpoint progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetaData {
    /// The partition.
    pub partition_id: PartitionId,
    /// Last checkpoint that included commits on this partition.
    pub last_checkpoint_id: Option<CheckpointId>,
    /// Last transaction on this partition covered by that checkpoint.
    pub last_transaction_id: Option<TransactionId>,
}

impl PartitionMetaData {
    /// Metadata of a partition that was never checkpointed.
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            last_checkpoint_id: None,
            last_transaction_id: None,
        }
    }
}

/// Identity of a delta inside one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeltaKey {
    /// Table name.
    pub table: String,
    /// Partition of the row.
    pub partition: PartitionId,
    /// JSON-encoded row key.
    pub key: String,
}

/// The net change of one row since the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDelta {
    /// Table name.
    pub table: String,
    /// Partition of the row.
    pub partition: PartitionId,
    /// JSON-encoded row key.
    pub key: String,
    /// Final value, `None` for deletions.
    pub value: Option<serde_json::Value>,
    /// How the store must apply the value.
    pub write_back: WriteBack,
}

impl RowDelta {
    fn delta_key(&self) -> DeltaKey {
        DeltaKey {
            table: self.table.clone(),
            partition: self.partition,
            key: self.key.clone(),
        }
    }
}

type PostPersist = Box<dyn FnOnce() + Send>;

/// Everything one checkpoint cycle has to write, plus what to run afterwards.
///
/// A command is filled once by [`CacheEngine::collect_next_checkpoint`](super::CacheEngine::collect_next_checkpoint).
/// If the durable write fails, the same command is written again; its content never
/// changes after collection.
#[derive(Default)]
pub struct CheckpointCommand {
    checkpoint_id: Option<CheckpointId>,
    through_transaction: Option<TransactionId>,
    deltas: BTreeMap<DeltaKey, RowDelta>,
    partitions: Vec<PartitionMetaData>,
    // Behind a mutex so `&CheckpointCommand` can cross an await into the store.
    post_persist: Mutex<Vec<PostPersist>>,
    completed: bool,
}

impl fmt::Debug for CheckpointCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCommand")
            .field("checkpoint_id", &self.checkpoint_id)
            .field("through_transaction", &self.through_transaction)
            .field("deltas", &self.deltas.len())
            .field("partitions", &self.partitions.len())
            .field("post_persist", &self.callbacks_len())
            .field("completed", &self.completed)
            .finish()
    }
}

impl CheckpointCommand {
    /// Create an empty, uncollected command.
    pub fn new() -> Self {
        Self::default()
    }

    /// The checkpoint id, once collected.
    pub fn checkpoint_id(&self) -> Option<CheckpointId> {
        self.checkpoint_id
    }

    /// Last transaction committed before the snapshot point.
    pub fn through_transaction(&self) -> Option<TransactionId> {
        self.through_transaction
    }

    /// Deltas ordered by table, partition and key.
    pub fn deltas(&self) -> impl Iterator<Item = &RowDelta> {
        self.deltas.values()
    }

    /// Look up the delta for one row.
    pub fn delta(&self, table: &str, partition: PartitionId, key: &str) -> Option<&RowDelta> {
        self.deltas.get(&DeltaKey {
            table: table.to_string(),
            partition,
            key: key.to_string(),
        })
    }

    /// Metadata of every partition, as of this checkpoint.
    pub fn partitions(&self) -> &[PartitionMetaData] {
        &self.partitions
    }

    /// Number of row deltas.
    pub fn row_count(&self) -> usize {
        self.deltas.len()
    }

    /// Whether the durable write succeeded and callbacks ran.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn callbacks_len(&self) -> usize {
        self.post_persist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn callbacks(&mut self) -> &mut Vec<PostPersist> {
        self.post_persist
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin(
        &mut self,
        checkpoint_id: CheckpointId,
        through_transaction: Option<TransactionId>,
    ) -> Result<()> {
        if let Some(existing) = self.checkpoint_id {
            return Err(CacheError::CommandAlreadyCollected(existing));
        }
        self.checkpoint_id = Some(checkpoint_id);
        self.through_transaction = through_transaction;
        Ok(())
    }

    pub(crate) fn set_partitions(&mut self, partitions: Vec<PartitionMetaData>) {
        self.partitions = partitions;
    }

    /// Add one row delta; a second delta for the same row is rejected.
    pub fn add_delta(&mut self, delta: RowDelta) -> Result<()> {
        let key = delta.delta_key();
        if self.deltas.contains_key(&key) {
            return Err(CacheError::DeltaCollision {
                table: key.table,
                partition: key.partition,
                key: key.key,
            });
        }
        self.deltas.insert(key, delta);
        Ok(())
    }

    /// Register a callback to run after the durable write succeeds.
    pub fn add_post_persist(&mut self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        if self.completed {
            return Err(CacheError::CallbackAfterPersist(
                self.checkpoint_id.unwrap_or(CheckpointId(0)),
            ));
        }
        self.callbacks().push(Box::new(callback));
        Ok(())
    }

    /// Mark the command durable and run its callbacks in registration order.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let callbacks = std::mem::take(self.callbacks());
        for callback in callbacks {
            callback();
        }
    }

    /// Write the command to `store`, then complete it.
    ///
    /// On failure the command is left untouched so the identical payload can be
    /// written again.
    pub async fn execute(&mut self, store: &dyn CheckpointStore) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        store.write_checkpoint(self).await?;
        debug!(
            checkpoint_id = ?self.checkpoint_id,
            rows = self.deltas.len(),
            callbacks = self.callbacks_len(),
            "Checkpoint persisted"
        );
        self.complete();
        Ok(())
    }
}
