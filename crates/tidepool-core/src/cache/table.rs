// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed, partitioned views over rows owned by the cache engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::checkpoint::RowDelta;
use super::row::{RowKey, RowValue, WriteBack};
use super::{PartitionId, lock};
use crate::error::Result;
use crate::store::CheckpointStore;

/// Maps a table's keys onto engine partitions.
pub enum Partitioner<K> {
    /// Every row lives in one partition.
    Single(PartitionId),
    /// Stable SHA-256 hash of the JSON-encoded key.
    Hashed,
    /// Caller-supplied partition function; the result is taken modulo the partition count.
    Custom(Arc<dyn Fn(&K) -> PartitionId + Send + Sync>),
}

impl<K> Clone for Partitioner<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(p) => Self::Single(*p),
            Self::Hashed => Self::Hashed,
            Self::Custom(f) => Self::Custom(f.clone()),
        }
    }
}

impl<K> fmt::Debug for Partitioner<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(p) => f.debug_tuple("Single").field(p).finish(),
            Self::Hashed => f.write_str("Hashed"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Rows of one table that fall into one partition.
///
/// A key missing from `rows` has never been loaded. `Some(None)` means the row is
/// known not to exist.
pub(crate) struct TablePartition<K, V> {
    pub rows: HashMap<K, Option<V>>,
    pub dirty: HashMap<K, WriteBack>,
}

impl<K, V> Default for TablePartition<K, V> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            dirty: HashMap::new(),
        }
    }
}

pub(crate) struct TableInner<K, V> {
    index: usize,
    engine_id: Uuid,
    name: String,
    partitioner: Partitioner<K>,
    partitions: Vec<Mutex<TablePartition<K, V>>>,
    store: Arc<dyn CheckpointStore>,
}

/// Table contributing deltas to checkpoints, with its key and value types erased.
pub(crate) trait CheckpointSource: Send + Sync {
    fn name(&self) -> &str;

    /// Append a delta for every dirty row without clearing anything.
    fn collect_deltas(&self, out: &mut Vec<RowDelta>) -> Result<()>;

    /// Clear every dirty marker.
    fn clear_dirty(&self);

    fn dirty_count(&self) -> usize;
}

/// Typed handle to a table registered with a [`CacheEngine`](super::CacheEngine).
///
/// Handles are cheap to clone. Mutations go through a [`TxContext`](super::TxContext);
/// the handle itself only reads committed state and loads missing rows.
pub struct Table<K, V> {
    inner: Arc<TableInner<K, V>>,
}

impl<K, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> fmt::Debug for Table<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("partitioner", &self.inner.partitioner)
            .field("partitions", &self.inner.partitions.len())
            .finish()
    }
}

impl<K: RowKey, V: RowValue> Table<K, V> {
    pub(crate) fn new(
        index: usize,
        engine_id: Uuid,
        name: &str,
        partitioner: Partitioner<K>,
        partition_count: u32,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let partitions = (0..partition_count.max(1))
            .map(|_| Mutex::new(TablePartition::default()))
            .collect();
        Self {
            inner: Arc::new(TableInner {
                index,
                engine_id,
                name: name.to_string(),
                partitioner,
                partitions,
                store,
            }),
        }
    }

    pub(crate) fn source(&self) -> Arc<dyn CheckpointSource> {
        self.inner.clone()
    }

    pub(crate) fn index(&self) -> usize {
        self.inner.index
    }

    pub(crate) fn engine_id(&self) -> Uuid {
        self.inner.engine_id
    }

    pub(crate) fn partition(&self, partition: PartitionId) -> MutexGuard<'_, TablePartition<K, V>> {
        lock(&self.inner.partitions[partition as usize % self.inner.partitions.len()])
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Partition a key belongs to.
    pub fn partition_of(&self, key: &K) -> PartitionId {
        let count = self.inner.partitions.len() as u32;
        match &self.inner.partitioner {
            Partitioner::Single(p) => p % count,
            Partitioner::Hashed => {
                let encoded = serde_json::to_vec(key).unwrap_or_default();
                let digest = Sha256::digest(&encoded);
                let prefix = [digest[0], digest[1], digest[2], digest[3]];
                u32::from_be_bytes(prefix) % count
            }
            Partitioner::Custom(f) => f(key) % count,
        }
    }

    /// Committed knowledge of a row: `None` if never loaded, `Some(None)` if known absent.
    pub fn cached(&self, key: &K) -> Option<Option<V>> {
        self.partition(self.partition_of(key)).rows.get(key).cloned()
    }

    /// Return the committed row, reading it from the store on first touch.
    pub async fn load(&self, key: &K) -> Result<Option<V>> {
        if let Some(known) = self.cached(key) {
            return Ok(known);
        }

        let partition = self.partition_of(key);
        let encoded = serde_json::to_string(key)?;
        let stored = self
            .inner
            .store
            .load_row(&self.inner.name, partition, &encoded)
            .await?;
        let value = stored.map(serde_json::from_value::<V>).transpose()?;

        debug!(
            table = %self.inner.name,
            partition,
            key = %encoded,
            found = value.is_some(),
            "Loaded row on cache miss"
        );

        // A commit may have made the row known while the read was in flight.
        let mut guard = self.partition(partition);
        Ok(guard.rows.entry(key.clone()).or_insert(value).clone())
    }

    /// Load every stored row of the table into the cache and return them.
    pub async fn preload_from_store(&self) -> Result<Vec<(K, V)>> {
        let stored = self.inner.store.scan_table(&self.inner.name).await?;
        let mut loaded = Vec::with_capacity(stored.len());
        for row in stored {
            let key: K = serde_json::from_str(&row.key)?;
            let value: V = serde_json::from_value(row.value)?;
            let partition = self.partition_of(&key);
            let mut guard = self.partition(partition);
            if let Some(current) = guard
                .rows
                .entry(key.clone())
                .or_insert(Some(value))
                .clone()
            {
                loaded.push((key, current));
            }
        }
        Ok(loaded)
    }

    /// Rows waiting for the next checkpoint.
    pub fn dirty_count(&self) -> usize {
        self.inner.dirty_count()
    }

    /// Rows the cache knows about, present or absent.
    pub fn cached_len(&self) -> usize {
        self.inner
            .partitions
            .iter()
            .map(|p| lock(p).rows.len())
            .sum()
    }
}

impl<K: RowKey, V: RowValue> CheckpointSource for TableInner<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect_deltas(&self, out: &mut Vec<RowDelta>) -> Result<()> {
        for (partition, slot) in self.partitions.iter().enumerate() {
            let guard = lock(slot);
            for (key, write_back) in &guard.dirty {
                let value = match write_back {
                    WriteBack::Created | WriteBack::Updated => guard
                        .rows
                        .get(key)
                        .cloned()
                        .flatten()
                        .map(serde_json::to_value)
                        .transpose()?,
                    WriteBack::Deleted | WriteBack::None => None,
                };
                out.push(RowDelta {
                    table: self.name.clone(),
                    partition: partition as PartitionId,
                    key: serde_json::to_string(key)?,
                    value,
                    write_back: *write_back,
                });
            }
        }
        Ok(())
    }

    fn clear_dirty(&self) {
        for slot in &self.partitions {
            lock(slot).dirty.clear();
        }
    }

    fn dirty_count(&self) -> usize {
        self.partitions.iter().map(|p| lock(p).dirty.len()).sum()
    }
}
