// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transactional row cache with checkpoint write-back.
//!
//! ```text
//!   TxContext ──commit──▶ CacheEngine ──dirty markers──▶ Table partitions
//!       │                     │
//!       │ on_applied          │ completion listeners ──▶ CheckpointWorker
//!       │                     │                              │
//!       │                     └──collect_next_checkpoint◀────┘
//!       │                                   │
//!       └─ on_persisted ◀── CheckpointCommand ──▶ CheckpointStore
//! ```
//!
//! The engine owns every table's rows. A transaction buffers its reduced per-row
//! write-backs and merges them atomically at commit; the checkpoint worker later
//! swaps the accumulated dirty markers out into a [`CheckpointCommand`] and writes
//! it to the store in one batch.

mod checkpoint;
mod engine;
mod row;
mod table;
mod transaction;
mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::checkpoint::{CheckpointCommand, DeltaKey, PartitionMetaData, RowDelta};
pub use self::engine::{CacheConfig, CacheEngine};
pub use self::row::{RowKey, RowValue, WriteBack};
pub use self::table::{Partitioner, Table};
pub use self::transaction::TxContext;
pub use self::worker::{CheckpointStats, CheckpointWorker, CheckpointWorkerConfig};

/// Index of an engine-wide partition.
pub type PartitionId = u32;

/// Identifier of a committed transaction, strictly increasing in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a collected checkpoint; increases by one per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock a std mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
