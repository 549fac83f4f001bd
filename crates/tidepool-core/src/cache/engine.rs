// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The persistent cache engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::checkpoint::{CheckpointCommand, PartitionMetaData};
use super::row::{RowKey, RowValue};
use super::table::{CheckpointSource, Partitioner, Table};
use super::transaction::{CompletionGate, TxContext};
use super::{CheckpointId, PartitionId, TransactionId, lock};
use crate::error::{CacheError, Result};
use crate::store::CheckpointStore;

/// Default number of engine partitions.
pub const DEFAULT_PARTITION_COUNT: u32 = 12;

/// Static engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of partitions shared by every table.
    pub partition_count: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

type CompletionListener = Arc<dyn Fn(TransactionId) + Send + Sync>;
type PersistHook = Box<dyn FnOnce() + Send>;

/// State that only changes at commit and checkpoint boundaries.
struct Sequencer {
    last_transaction: u64,
    last_checkpoint: u64,
    partitions: Vec<PartitionMetaData>,
    /// Partitions committed to since the last checkpoint, with their latest transaction.
    unflushed: BTreeMap<PartitionId, TransactionId>,
    /// Persisted hooks of committed transactions, attached to the next checkpoint.
    awaiting_persist: Vec<PersistHook>,
}

struct EngineInner {
    id: Uuid,
    config: CacheConfig,
    store: Arc<dyn CheckpointStore>,
    sequencer: Mutex<Sequencer>,
    tables: RwLock<Vec<Arc<dyn CheckpointSource>>>,
    listeners: RwLock<HashMap<PartitionId, Vec<CompletionListener>>>,
}

/// Single authority for in-memory row state and checkpoint boundaries.
///
/// Cloning yields another handle to the same engine. Commits and checkpoint
/// collection serialize on one sequencer lock; row storage is locked per table
/// partition.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("store", &"...")
            .finish()
    }
}

impl CacheEngine {
    /// Create an engine with no checkpoint history.
    pub fn new(config: CacheConfig, store: Arc<dyn CheckpointStore>) -> Self {
        let partition_count = config.partition_count.max(1);
        let partitions = (0..partition_count).map(PartitionMetaData::new).collect();
        Self {
            inner: Arc::new(EngineInner {
                id: Uuid::new_v4(),
                config: CacheConfig { partition_count },
                store,
                sequencer: Mutex::new(Sequencer {
                    last_transaction: 0,
                    last_checkpoint: 0,
                    partitions,
                    unflushed: BTreeMap::new(),
                    awaiting_persist: Vec::new(),
                }),
                tables: RwLock::new(Vec::new()),
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create an engine that resumes the counters recorded in `store`.
    #[instrument(skip(store), fields(partition_count = config.partition_count))]
    pub async fn open(config: CacheConfig, store: Arc<dyn CheckpointStore>) -> Result<Self> {
        let recovered = store.recover().await?;
        let engine = Self::new(config, store);
        {
            let mut seq = lock(&engine.inner.sequencer);
            seq.last_checkpoint = recovered.last_checkpoint_id.map(|id| id.0).unwrap_or(0);
            for meta in recovered.partitions {
                if let Some(tx) = meta.last_transaction_id {
                    seq.last_transaction = seq.last_transaction.max(tx.0);
                }
                if let Some(slot) = seq.partitions.get_mut(meta.partition_id as usize) {
                    *slot = meta;
                }
            }
            info!(
                last_checkpoint = seq.last_checkpoint,
                last_transaction = seq.last_transaction,
                "Cache engine recovered checkpoint progress"
            );
        }
        Ok(engine)
    }

    pub(crate) fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Engine settings.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Number of engine partitions.
    pub fn partition_count(&self) -> u32 {
        self.inner.config.partition_count
    }

    /// The store checkpoints are written to.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }

    /// Register a table and return its typed handle.
    pub fn register_table<K: RowKey, V: RowValue>(
        &self,
        name: &str,
        partitioner: Partitioner<K>,
    ) -> Result<Table<K, V>> {
        let mut tables = self
            .inner
            .tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tables.iter().any(|t| t.name() == name) {
            return Err(CacheError::DuplicateTable(name.to_string()));
        }
        let table = Table::new(
            tables.len(),
            self.inner.id,
            name,
            partitioner,
            self.partition_count(),
            self.inner.store.clone(),
        );
        tables.push(table.source());
        debug!(table = %name, index = tables.len() - 1, "Registered table");
        Ok(table)
    }

    /// Open a transaction; `partition_hint` is notified on commit even if nothing is written.
    pub fn start_transaction(&self, partition_hint: Option<PartitionId>) -> TxContext {
        TxContext::new(self.clone(), partition_hint)
    }

    /// Call `listener` after every commit that touches `partition`.
    ///
    /// Listeners run synchronously inside the commit and must not commit themselves.
    pub fn add_transaction_completion_listener(
        &self,
        partition: PartitionId,
        listener: impl Fn(TransactionId) + Send + Sync + 'static,
    ) {
        let listener: CompletionListener = Arc::new(listener);
        self.listeners_mut()
            .entry(partition % self.partition_count())
            .or_default()
            .push(listener);
    }

    /// Register one listener on every partition.
    pub fn add_completion_listener_all(
        &self,
        listener: impl Fn(TransactionId) + Send + Sync + 'static,
    ) {
        let listener: CompletionListener = Arc::new(listener);
        let mut listeners = self.listeners_mut();
        for partition in 0..self.partition_count() {
            listeners
                .entry(partition)
                .or_default()
                .push(listener.clone());
        }
    }

    fn listeners_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<PartitionId, Vec<CompletionListener>>> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fire_listeners(&self, touched: &BTreeSet<PartitionId>, transaction_id: TransactionId) {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for partition in touched {
            if let Some(registered) = listeners.get(partition) {
                for listener in registered {
                    listener(transaction_id);
                }
            }
        }
    }

    pub(crate) fn commit(&self, tx: TxContext) -> Result<TransactionId> {
        let (hint, writes, on_committed, on_applied, on_persisted) = tx.into_parts();
        let mut touched = BTreeSet::new();
        if let Some(partition) = hint {
            touched.insert(partition % self.partition_count());
        }

        let (transaction_id, gate) = {
            let mut seq = lock(&self.inner.sequencer);

            let prepared = writes
                .into_values()
                .map(|w| w.prepare())
                .collect::<Result<Vec<_>>>()?;

            seq.last_transaction += 1;
            let transaction_id = TransactionId(seq.last_transaction);

            for writes in prepared {
                writes.apply(&mut touched);
            }
            for partition in &touched {
                seq.unflushed.insert(*partition, transaction_id);
            }

            let gate = if on_persisted.is_empty() {
                None
            } else {
                let gate = CompletionGate::new(transaction_id, on_persisted);
                let hook = gate.clone();
                seq.awaiting_persist
                    .push(Box::new(move || hook.mark_persisted()));
                Some(gate)
            };

            self.fire_listeners(&touched, transaction_id);
            for callback in on_committed {
                callback(transaction_id);
            }
            (transaction_id, gate)
        };

        for callback in on_applied {
            callback(transaction_id);
        }
        if let Some(gate) = gate {
            gate.mark_applied();
        }

        Ok(transaction_id)
    }

    /// Snapshot every dirty row into `command` and start the next checkpoint.
    ///
    /// Commits that finish after this returns belong to a later checkpoint. The
    /// checkpoint id advances by one on every call, even when nothing is dirty.
    pub fn collect_next_checkpoint(&self, command: &mut CheckpointCommand) -> Result<CheckpointId> {
        if let Some(existing) = command.checkpoint_id() {
            return Err(CacheError::CommandAlreadyCollected(existing));
        }

        let mut seq = lock(&self.inner.sequencer);
        let tables = self
            .inner
            .tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut deltas = Vec::new();
        for table in tables.iter() {
            table.collect_deltas(&mut deltas)?;
        }

        let checkpoint_id = CheckpointId(seq.last_checkpoint + 1);
        let through = (seq.last_transaction > 0).then_some(TransactionId(seq.last_transaction));
        command.begin(checkpoint_id, through)?;
        for delta in deltas {
            command.add_delta(delta)?;
        }
        for table in tables.iter() {
            table.clear_dirty();
        }

        seq.last_checkpoint = checkpoint_id.0;
        let unflushed = std::mem::take(&mut seq.unflushed);
        for (partition, transaction_id) in &unflushed {
            if let Some(meta) = seq.partitions.get_mut(*partition as usize) {
                meta.last_checkpoint_id = Some(checkpoint_id);
                meta.last_transaction_id = Some(*transaction_id);
            }
        }
        command.set_partitions(seq.partitions.clone());
        for hook in std::mem::take(&mut seq.awaiting_persist) {
            command.add_post_persist(hook)?;
        }

        debug!(
            checkpoint_id = %checkpoint_id,
            rows = command.row_count(),
            partitions = unflushed.len(),
            "Collected checkpoint"
        );
        Ok(checkpoint_id)
    }

    /// Whether a checkpoint would capture anything: dirty rows, commits or waiting callbacks.
    pub fn has_pending_checkpoint(&self) -> bool {
        {
            let seq = lock(&self.inner.sequencer);
            if !seq.unflushed.is_empty() || !seq.awaiting_persist.is_empty() {
                return true;
            }
        }
        self.dirty_row_count() > 0
    }

    /// Rows waiting for the next checkpoint, across all tables.
    pub fn dirty_row_count(&self) -> usize {
        self.inner
            .tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|t| t.dirty_count())
            .sum()
    }

    /// Partitions with commits not yet captured by a checkpoint.
    pub fn unflushed_partitions(&self) -> usize {
        lock(&self.inner.sequencer).unflushed.len()
    }

    /// Most recent committed transaction.
    pub fn last_committed(&self) -> Option<TransactionId> {
        let last = lock(&self.inner.sequencer).last_transaction;
        (last > 0).then_some(TransactionId(last))
    }

    /// Most recent collected checkpoint.
    pub fn last_checkpoint(&self) -> Option<CheckpointId> {
        let last = lock(&self.inner.sequencer).last_checkpoint;
        (last > 0).then_some(CheckpointId(last))
    }

    /// Current metadata of every partition.
    pub fn partition_metadata(&self) -> Vec<PartitionMetaData> {
        lock(&self.inner.sequencer).partitions.clone()
    }
}
