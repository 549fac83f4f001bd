// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction context: buffered, reduced row writes committed atomically.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, join_all};

use super::engine::CacheEngine;
use super::row::{PendingRow, RowKey, RowValue, WriteBack};
use super::table::Table;
use super::{PartitionId, TransactionId, lock};
use crate::error::{CacheError, Result};

pub(crate) type TxCallback = Box<dyn FnOnce(TransactionId) + Send>;

/// One table's buffered writes, with the key and value types erased.
pub(crate) trait PendingWrites: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Validate every row against committed state and fold it onto the dirty markers.
    ///
    /// Must run while the engine sequencer is held.
    fn prepare(self: Box<Self>) -> Result<Box<dyn PreparedWrites>>;
}

/// Validated writes that can no longer fail.
pub(crate) trait PreparedWrites {
    fn apply(self: Box<Self>, touched: &mut BTreeSet<PartitionId>);
}

struct TableWrites<K, V> {
    table: Table<K, V>,
    rows: HashMap<K, PendingRow<V>>,
}

struct PlannedRow<K, V> {
    partition: PartitionId,
    key: K,
    value: Option<V>,
    write_back: WriteBack,
    dirty: WriteBack,
}

struct PreparedTable<K, V> {
    table: Table<K, V>,
    rows: Vec<PlannedRow<K, V>>,
}

impl<K: RowKey, V: RowValue> PendingWrites for TableWrites<K, V> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn prepare(self: Box<Self>) -> Result<Box<dyn PreparedWrites>> {
        let TableWrites { table, rows } = *self;
        let mut planned = Vec::with_capacity(rows.len());

        for (key, pending) in rows {
            let partition = table.partition_of(&key);
            let guard = table.partition(partition);
            let committed = guard.rows.get(&key);

            match pending.write_back {
                WriteBack::None => {}
                WriteBack::Created => {
                    if let Some(Some(_)) = committed {
                        return Err(CacheError::RowAlreadyExists {
                            table: table.name().to_string(),
                            key: format!("{:?}", key),
                        });
                    }
                }
                WriteBack::Updated | WriteBack::Deleted => match committed {
                    None => {
                        return Err(CacheError::RowNotLoaded {
                            table: table.name().to_string(),
                            key: format!("{:?}", key),
                        });
                    }
                    Some(None) => {
                        return Err(CacheError::RowNotFound {
                            table: table.name().to_string(),
                            key: format!("{:?}", key),
                        });
                    }
                    Some(Some(_)) => {}
                },
            }

            let earlier = guard.dirty.get(&key).copied().unwrap_or_default();
            let dirty = earlier.then(pending.write_back).ok_or_else(|| {
                CacheError::InvalidTransition {
                    table: table.name().to_string(),
                    key: format!("{:?}", key),
                    earlier,
                    later: pending.write_back,
                }
            })?;
            drop(guard);

            planned.push(PlannedRow {
                partition,
                key,
                value: pending.value,
                write_back: pending.write_back,
                dirty,
            });
        }

        Ok(Box::new(PreparedTable {
            table,
            rows: planned,
        }))
    }
}

impl<K: RowKey, V: RowValue> PreparedWrites for PreparedTable<K, V> {
    fn apply(self: Box<Self>, touched: &mut BTreeSet<PartitionId>) {
        for row in self.rows {
            touched.insert(row.partition);
            if row.write_back == WriteBack::None {
                continue;
            }
            let mut guard = self.table.partition(row.partition);
            if row.dirty == WriteBack::None {
                guard.dirty.remove(&row.key);
            } else {
                guard.dirty.insert(row.key.clone(), row.dirty);
            }
            guard.rows.insert(row.key, row.value);
        }
    }
}

/// Orders a transaction's persisted callbacks after its applied callbacks.
///
/// The checkpoint worker may persist the transaction before the committing task has
/// finished running its applied callbacks; whichever side finishes last runs the
/// persisted callbacks.
pub(crate) struct CompletionGate {
    transaction_id: TransactionId,
    state: Mutex<GateState>,
}

struct GateState {
    applied: bool,
    persisted: bool,
    callbacks: Vec<TxCallback>,
}

impl CompletionGate {
    pub(crate) fn new(transaction_id: TransactionId, callbacks: Vec<TxCallback>) -> Arc<Self> {
        Arc::new(Self {
            transaction_id,
            state: Mutex::new(GateState {
                applied: false,
                persisted: false,
                callbacks,
            }),
        })
    }

    pub(crate) fn mark_applied(&self) {
        let ready = {
            let mut state = lock(&self.state);
            state.applied = true;
            if state.persisted {
                std::mem::take(&mut state.callbacks)
            } else {
                Vec::new()
            }
        };
        self.run(ready);
    }

    pub(crate) fn mark_persisted(&self) {
        let ready = {
            let mut state = lock(&self.state);
            state.persisted = true;
            if state.applied {
                std::mem::take(&mut state.callbacks)
            } else {
                Vec::new()
            }
        };
        self.run(ready);
    }

    fn run(&self, callbacks: Vec<TxCallback>) {
        for callback in callbacks {
            callback(self.transaction_id);
        }
    }
}

/// A unit of atomic mutation against the cache.
///
/// Reads observe the transaction's own pending writes first, then the last
/// committed state. Nothing is visible to other transactions until
/// [`commit`](Self::commit); dropping the context discards it.
pub struct TxContext {
    engine: CacheEngine,
    partition_hint: Option<PartitionId>,
    writes: BTreeMap<usize, Box<dyn PendingWrites>>,
    prefetches: Vec<BoxFuture<'static, Result<()>>>,
    on_committed: Vec<TxCallback>,
    on_applied: Vec<TxCallback>,
    on_persisted: Vec<TxCallback>,
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("partition_hint", &self.partition_hint)
            .field("tables", &self.writes.len())
            .field("prefetches", &self.prefetches.len())
            .field("on_committed", &self.on_committed.len())
            .field("on_applied", &self.on_applied.len())
            .field("on_persisted", &self.on_persisted.len())
            .finish()
    }
}

impl TxContext {
    pub(crate) fn new(engine: CacheEngine, partition_hint: Option<PartitionId>) -> Self {
        Self {
            engine,
            partition_hint,
            writes: BTreeMap::new(),
            prefetches: Vec::new(),
            on_committed: Vec::new(),
            on_applied: Vec::new(),
            on_persisted: Vec::new(),
        }
    }

    /// Partition this transaction was started for.
    pub fn partition_hint(&self) -> Option<PartitionId> {
        self.partition_hint
    }

    fn check_table<K: RowKey, V: RowValue>(&self, table: &Table<K, V>) -> Result<()> {
        if table.engine_id() != self.engine.id() {
            return Err(CacheError::ForeignTable(table.name().to_string()));
        }
        Ok(())
    }

    fn pending<K: RowKey, V: RowValue>(
        &self,
        table: &Table<K, V>,
        key: &K,
    ) -> Option<&PendingRow<V>> {
        self.writes
            .get(&table.index())
            .and_then(|w| w.as_any().downcast_ref::<TableWrites<K, V>>())
            .and_then(|w| w.rows.get(key))
    }

    fn table_writes<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
    ) -> Result<&mut TableWrites<K, V>> {
        self.check_table(table)?;
        self.writes
            .entry(table.index())
            .or_insert_with(|| {
                Box::new(TableWrites::<K, V> {
                    table: table.clone(),
                    rows: HashMap::new(),
                }) as Box<dyn PendingWrites>
            })
            .as_any_mut()
            .downcast_mut::<TableWrites<K, V>>()
            .ok_or_else(|| {
                CacheError::Internal(format!("table '{}' used with mismatched types", table.name()))
            })
    }

    /// What this transaction sees for a row; `None` if the row was never loaded.
    fn visible<K: RowKey, V: RowValue>(
        &self,
        table: &Table<K, V>,
        key: &K,
    ) -> Option<Option<V>> {
        match self.pending(table, key) {
            Some(row) => Some(row.value.clone()),
            None => table.cached(key),
        }
    }

    fn record<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
        key: K,
        value: Option<V>,
        write_back: WriteBack,
    ) -> Result<()> {
        let writes = self.table_writes(table)?;
        let earlier = writes
            .rows
            .get(&key)
            .map(|row| row.write_back)
            .unwrap_or_default();
        let folded = earlier
            .then(write_back)
            .ok_or_else(|| CacheError::InvalidTransition {
                table: table.name().to_string(),
                key: format!("{:?}", key),
                earlier,
                later: write_back,
            })?;
        writes.rows.insert(
            key,
            PendingRow {
                value,
                write_back: folded,
            },
        );
        Ok(())
    }

    /// Insert a row that is not known to exist.
    pub fn create<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
        key: K,
        value: V,
    ) -> Result<()> {
        self.check_table(table)?;
        if let Some(Some(_)) = self.visible(table, &key) {
            return Err(CacheError::RowAlreadyExists {
                table: table.name().to_string(),
                key: format!("{:?}", key),
            });
        }
        self.record(table, key, Some(value), WriteBack::Created)
    }

    fn require_present<K: RowKey, V: RowValue>(
        &self,
        table: &Table<K, V>,
        key: &K,
    ) -> Result<V> {
        self.check_table(table)?;
        match self.visible(table, key) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(CacheError::RowNotFound {
                table: table.name().to_string(),
                key: format!("{:?}", key),
            }),
            None => Err(CacheError::RowNotLoaded {
                table: table.name().to_string(),
                key: format!("{:?}", key),
            }),
        }
    }

    /// Replace the value of a row known to exist.
    pub fn update<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
        key: K,
        value: V,
    ) -> Result<()> {
        self.require_present(table, &key)?;
        self.record(table, key, Some(value), WriteBack::Updated)
    }

    /// Delete a row known to exist.
    pub fn delete<K: RowKey, V: RowValue>(&mut self, table: &Table<K, V>, key: K) -> Result<()> {
        self.require_present(table, &key)?;
        self.record(table, key, None, WriteBack::Deleted)
    }

    /// Create or update depending on what is known about the row.
    pub fn upsert<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
        key: K,
        value: V,
    ) -> Result<()> {
        self.check_table(table)?;
        match self.visible(table, &key) {
            Some(Some(_)) => self.record(table, key, Some(value), WriteBack::Updated),
            Some(None) => self.record(table, key, Some(value), WriteBack::Created),
            None => Err(CacheError::RowNotLoaded {
                table: table.name().to_string(),
                key: format!("{:?}", key),
            }),
        }
    }

    /// Read a row that must already be cached.
    pub fn try_get<K: RowKey, V: RowValue>(
        &self,
        table: &Table<K, V>,
        key: &K,
    ) -> Result<Option<V>> {
        self.check_table(table)?;
        self.visible(table, key).ok_or_else(|| CacheError::RowNotLoaded {
            table: table.name().to_string(),
            key: format!("{:?}", key),
        })
    }

    /// Read a row, loading it from the store on first touch.
    pub async fn get<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
        key: &K,
    ) -> Result<Option<V>> {
        self.check_table(table)?;
        if let Some(known) = self.visible(table, key) {
            return Ok(known);
        }
        table.load(key).await
    }

    /// Schedule a load of `key` without waiting for it.
    ///
    /// Loads are awaited together by [`complete_prefetches`](Self::complete_prefetches).
    pub fn prefetch<K: RowKey, V: RowValue>(
        &mut self,
        table: &Table<K, V>,
        key: K,
    ) -> Result<()> {
        self.check_table(table)?;
        if self.visible(table, &key).is_some() {
            return Ok(());
        }
        let table = table.clone();
        self.prefetches
            .push(Box::pin(async move { table.load(&key).await.map(|_| ()) }));
        Ok(())
    }

    /// Await every outstanding prefetch.
    pub async fn complete_prefetches(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.prefetches);
        if pending.is_empty() {
            return Ok(());
        }
        join_all(pending).await.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Run `callback` inside the commit, in transaction id order.
    ///
    /// Callbacks of different transactions never interleave or reorder. They run
    /// while the commit sequencer is held and must not block or commit.
    pub fn on_committed(&mut self, callback: impl FnOnce(TransactionId) + Send + 'static) {
        self.on_committed.push(Box::new(callback));
    }

    /// Run `callback` once the commit is merged into the shared cache.
    ///
    /// Callbacks of concurrent commits may run in either order.
    pub fn on_applied(&mut self, callback: impl FnOnce(TransactionId) + Send + 'static) {
        self.on_applied.push(Box::new(callback));
    }

    /// Run `callback` once the checkpoint holding this transaction is durable.
    pub fn on_persisted(&mut self, callback: impl FnOnce(TransactionId) + Send + 'static) {
        self.on_persisted.push(Box::new(callback));
    }

    /// Whether the transaction buffered any row operation.
    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Merge the transaction into the cache.
    ///
    /// Either every row is applied or none is. Committed and applied callbacks run
    /// before this returns; persisted callbacks run after the covering checkpoint is written.
    pub fn commit(self) -> Result<TransactionId> {
        let engine = self.engine.clone();
        engine.commit(self)
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Option<PartitionId>,
        BTreeMap<usize, Box<dyn PendingWrites>>,
        Vec<TxCallback>,
        Vec<TxCallback>,
        Vec<TxCallback>,
    ) {
        (
            self.partition_hint,
            self.writes,
            self.on_committed,
            self.on_applied,
            self.on_persisted,
        )
    }
}
