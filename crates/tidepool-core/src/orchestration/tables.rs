// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed views over the four task hub tables.

use super::types::{ActivityMessage, History, HistoryEvent, InstanceRecord, TaskMessage};
use crate::cache::{CacheEngine, PartitionId, Partitioner, Table, TxContext};
use crate::error::{CacheError, Result};

/// Table names as stored in the checkpoint store.
pub const INSTANCES: &str = "Instances";
pub const HISTORIES: &str = "Histories";
pub const MESSAGES: &str = "Messages";
pub const ACTIVITIES: &str = "Activities";

/// Per-instance status and metadata, keyed by instance id.
#[derive(Debug, Clone)]
pub struct InstancesTable {
    table: Table<String, InstanceRecord>,
}

impl InstancesTable {
    /// The underlying table.
    pub fn table(&self) -> &Table<String, InstanceRecord> {
        &self.table
    }

    /// Partition an instance lives in.
    pub fn partition_of(&self, instance_id: &str) -> PartitionId {
        self.table.partition_of(&instance_id.to_string())
    }

    /// Read the instance record, loading it if needed.
    pub async fn get_state(
        &self,
        tx: &mut TxContext,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>> {
        tx.get(&self.table, &instance_id.to_string()).await
    }

    /// Write the instance record. The row must have been read in this transaction.
    pub fn set_state(&self, tx: &mut TxContext, record: InstanceRecord) -> Result<()> {
        tx.upsert(&self.table, record.instance_id.clone(), record)
    }

    /// Remove the instance record.
    pub fn delete(&self, tx: &mut TxContext, instance_id: &str) -> Result<()> {
        tx.delete(&self.table, instance_id.to_string())
    }
}

/// Event log of the current execution, keyed by instance id.
#[derive(Debug, Clone)]
pub struct HistoriesTable {
    table: Table<String, History>,
}

impl HistoriesTable {
    /// The underlying table.
    pub fn table(&self) -> &Table<String, History> {
        &self.table
    }

    /// Read the history, loading it if needed.
    pub async fn get_history(
        &self,
        tx: &mut TxContext,
        instance_id: &str,
    ) -> Result<Option<History>> {
        tx.get(&self.table, &instance_id.to_string()).await
    }

    /// Append `events` at `position`, which must equal the current event count.
    ///
    /// A missing history is created when `position` is zero.
    pub fn append_events(
        &self,
        tx: &mut TxContext,
        instance_id: &str,
        execution_id: &str,
        position: usize,
        events: Vec<HistoryEvent>,
    ) -> Result<()> {
        let key = instance_id.to_string();
        match tx.try_get(&self.table, &key)? {
            Some(mut history) => {
                if history.len() != position {
                    return Err(CacheError::HistoryConflict {
                        instance_id: key,
                        expected: position,
                        actual: history.len(),
                    });
                }
                history.execution_id = Some(execution_id.to_string());
                history.events.extend(events);
                tx.update(&self.table, key, history)
            }
            None => {
                if position != 0 {
                    return Err(CacheError::HistoryConflict {
                        instance_id: key,
                        expected: position,
                        actual: 0,
                    });
                }
                let history = History {
                    execution_id: Some(execution_id.to_string()),
                    events,
                };
                tx.create(&self.table, key, history)
            }
        }
    }

    /// Replace the whole history, as when a new execution starts.
    pub fn replace_history(
        &self,
        tx: &mut TxContext,
        instance_id: &str,
        history: History,
    ) -> Result<()> {
        tx.upsert(&self.table, instance_id.to_string(), history)
    }

    /// Remove the history.
    pub fn delete(&self, tx: &mut TxContext, instance_id: &str) -> Result<()> {
        tx.delete(&self.table, instance_id.to_string())
    }
}

/// Pending orchestration messages, keyed by sequence number.
#[derive(Debug, Clone)]
pub struct MessagesTable {
    table: Table<u64, TaskMessage>,
}

impl MessagesTable {
    /// The underlying table.
    pub fn table(&self) -> &Table<u64, TaskMessage> {
        &self.table
    }

    /// Store a message that already carries its sequence number.
    pub fn add(&self, tx: &mut TxContext, message: TaskMessage) -> Result<()> {
        tx.create(&self.table, message.sequence, message)
    }

    /// Remove a consumed message.
    pub fn remove(&self, tx: &mut TxContext, sequence: u64) -> Result<()> {
        tx.delete(&self.table, sequence)
    }
}

/// Pending activity invocations, keyed by sequence number.
#[derive(Debug, Clone)]
pub struct ActivitiesTable {
    table: Table<u64, ActivityMessage>,
}

impl ActivitiesTable {
    /// The underlying table.
    pub fn table(&self) -> &Table<u64, ActivityMessage> {
        &self.table
    }

    /// Store an activity that already carries its sequence number.
    pub fn add(&self, tx: &mut TxContext, activity: ActivityMessage) -> Result<()> {
        tx.create(&self.table, activity.sequence, activity)
    }

    /// Remove a finished activity.
    pub fn remove(&self, tx: &mut TxContext, sequence: u64) -> Result<()> {
        tx.delete(&self.table, sequence)
    }
}

/// All task hub tables, registered on one engine.
#[derive(Debug, Clone)]
pub struct TaskHubTables {
    pub instances: InstancesTable,
    pub histories: HistoriesTable,
    pub messages: MessagesTable,
    pub activities: ActivitiesTable,
}

impl TaskHubTables {
    /// Register the task hub tables with `engine`.
    pub fn register(engine: &CacheEngine) -> Result<Self> {
        Ok(Self {
            instances: InstancesTable {
                table: engine.register_table(INSTANCES, Partitioner::Hashed)?,
            },
            histories: HistoriesTable {
                table: engine.register_table(HISTORIES, Partitioner::Hashed)?,
            },
            messages: MessagesTable {
                table: engine.register_table(MESSAGES, Partitioner::Hashed)?,
            },
            activities: ActivitiesTable {
                table: engine.register_table(ACTIVITIES, Partitioner::Hashed)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::orchestration::types::EventKind;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn tables() -> (CacheEngine, TaskHubTables) {
        let engine = CacheEngine::new(CacheConfig::default(), Arc::new(MemoryStore::new()));
        let tables = TaskHubTables::register(&engine).unwrap();
        (engine, tables)
    }

    fn event(id: u64) -> HistoryEvent {
        HistoryEvent::new(id, EventKind::OrchestratorStarted)
    }

    #[tokio::test]
    async fn test_append_events_checks_position() {
        let (engine, tables) = tables();

        let mut tx = engine.start_transaction(None);
        assert!(tables.histories.get_history(&mut tx, "i").await.unwrap().is_none());
        tables
            .histories
            .append_events(&mut tx, "i", "e1", 0, vec![event(0), event(1)])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = engine.start_transaction(None);
        let err = tables
            .histories
            .append_events(&mut tx, "i", "e1", 1, vec![event(2)])
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::HistoryConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        tables
            .histories
            .append_events(&mut tx, "i", "e1", 2, vec![event(2)])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = engine.start_transaction(None);
        let history = tables.histories.get_history(&mut tx, "i").await.unwrap().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.execution_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn test_set_state_requires_read_first() {
        let (engine, tables) = tables();
        let now = chrono::Utc::now();
        let record = InstanceRecord {
            instance_id: "order-1".to_string(),
            execution_id: "e1".to_string(),
            name: "ProcessOrder".to_string(),
            version: None,
            status: crate::orchestration::InstanceStatus::Pending,
            input: None,
            output: None,
            created_at: now,
            last_updated_at: now,
            completed_at: None,
        };

        let mut tx = engine.start_transaction(None);
        let err = tables.instances.set_state(&mut tx, record.clone()).unwrap_err();
        assert_eq!(err.error_code(), "ROW_NOT_LOADED");

        assert!(tables.instances.get_state(&mut tx, "order-1").await.unwrap().is_none());
        tables.instances.set_state(&mut tx, record.clone()).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            tables.instances.table().cached(&"order-1".to_string()),
            Some(Some(record))
        );
    }
}
