// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed checkpoint store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{debug, instrument};

use super::{CheckpointStore, RecoveredState, StoredRow, from_db, partition_from_db, to_db};
use crate::cache::{
    CheckpointCommand, CheckpointId, PartitionId, PartitionMetaData, TransactionId, WriteBack,
};
use crate::error::{CacheError, Result};
use crate::migrations;

/// SQLite-backed checkpoint store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    app_name: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("app_name", &self.app_name)
            .finish()
    }
}

impl SqliteStore {
    /// Create a store from a pool whose schema is already migrated.
    pub fn new(pool: SqlitePool, app_name: &str) -> Self {
        Self {
            pool,
            app_name: app_name.to_string(),
        }
    }

    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// Parent directories are created. `busy_timeout` bounds how long a write waits
    /// for the database lock.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/tidepool.db", Duration::from_secs(30), "tidepool").await?;
    /// ```
    pub async fn from_path(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        app_name: &str,
    ) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::store(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::store(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self::new(pool, app_name))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    #[instrument(skip(self, command), fields(checkpoint_id = ?command.checkpoint_id()))]
    async fn write_checkpoint(&self, command: &CheckpointCommand) -> Result<()> {
        let checkpoint_id = command
            .checkpoint_id()
            .ok_or_else(|| CacheError::Internal("checkpoint command was never collected".into()))?;
        let checkpoint = to_db(checkpoint_id.0)?;

        let mut tx = self.pool.begin().await?;

        for delta in command.deltas() {
            match (delta.write_back, &delta.value) {
                (WriteBack::Created | WriteBack::Updated, Some(value)) => {
                    sqlx::query(
                        r#"
                        INSERT INTO rows (table_name, partition_id, row_key, value, updated_checkpoint)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT (table_name, row_key) DO UPDATE SET
                            partition_id = excluded.partition_id,
                            value = excluded.value,
                            updated_checkpoint = excluded.updated_checkpoint
                        "#,
                    )
                    .bind(&delta.table)
                    .bind(i64::from(delta.partition))
                    .bind(&delta.key)
                    .bind(value.to_string())
                    .bind(checkpoint)
                    .execute(&mut *tx)
                    .await?;
                }
                _ => {
                    sqlx::query("DELETE FROM rows WHERE table_name = ? AND row_key = ?")
                        .bind(&delta.table)
                        .bind(&delta.key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for meta in command.partitions() {
            sqlx::query(
                r#"
                INSERT INTO partitions (partition_id, last_checkpoint_id, last_transaction_id)
                VALUES (?, ?, ?)
                ON CONFLICT (partition_id) DO UPDATE SET
                    last_checkpoint_id = excluded.last_checkpoint_id,
                    last_transaction_id = excluded.last_transaction_id
                "#,
            )
            .bind(i64::from(meta.partition_id))
            .bind(meta.last_checkpoint_id.map(|id| to_db(id.0)).transpose()?)
            .bind(meta.last_transaction_id.map(|id| to_db(id.0)).transpose()?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (checkpoint_id, through_transaction, row_count, written_by)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (checkpoint_id) DO UPDATE SET
                through_transaction = excluded.through_transaction,
                row_count = excluded.row_count,
                written_by = excluded.written_by
            "#,
        )
        .bind(checkpoint)
        .bind(command.through_transaction().map(|id| to_db(id.0)).transpose()?)
        .bind(command.row_count() as i64)
        .bind(&self.app_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(rows = command.row_count(), "Checkpoint written to SQLite");
        Ok(())
    }

    async fn load_row(
        &self,
        table: &str,
        _partition: PartitionId,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM rows WHERE table_name = ? AND row_key = ?")
                .bind(table)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(value,)| serde_json::from_str(&value))
            .transpose()?)
    }

    async fn scan_table(&self, table: &str) -> Result<Vec<StoredRow>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT partition_id, row_key, value
            FROM rows
            WHERE table_name = ?
            ORDER BY partition_id, row_key
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(partition, key, value)| {
                Ok(StoredRow {
                    partition: partition_from_db(partition)?,
                    key,
                    value: serde_json::from_str(&value)?,
                })
            })
            .collect()
    }

    async fn recover(&self) -> Result<RecoveredState> {
        let (last,): (Option<i64>,) = sqlx::query_as("SELECT MAX(checkpoint_id) FROM checkpoints")
            .fetch_one(&self.pool)
            .await?;

        let partitions: Vec<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT partition_id, last_checkpoint_id, last_transaction_id
            FROM partitions
            ORDER BY partition_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let partitions = partitions
            .into_iter()
            .map(|(partition, checkpoint, transaction)| {
                Ok(PartitionMetaData {
                    partition_id: partition_from_db(partition)?,
                    last_checkpoint_id: checkpoint.map(from_db).transpose()?.map(CheckpointId),
                    last_transaction_id: transaction.map(from_db).transpose()?.map(TransactionId),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RecoveredState {
            last_checkpoint_id: last.map(from_db).transpose()?.map(CheckpointId),
            partitions,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheEngine, Partitioner, Table};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_from_path_creates_directories_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/tidepool.db");

        let store = SqliteStore::from_path(&path, Duration::from_secs(5), "test")
            .await
            .unwrap();

        assert!(path.exists());
        assert!(store.health_check().await.unwrap());
        assert_eq!(store.recover().await.unwrap(), RecoveredState::default());
    }

    #[tokio::test]
    async fn test_rewriting_the_same_checkpoint_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteStore::from_path(dir.path().join("t.db"), Duration::from_secs(5), "test")
                .await
                .unwrap(),
        );
        let engine = CacheEngine::new(CacheConfig { partition_count: 2 }, store.clone());
        let table: Table<String, i64> = engine
            .register_table("Numbers", Partitioner::Single(1))
            .unwrap();

        let mut tx = engine.start_transaction(None);
        tx.create(&table, "one".to_string(), 1).unwrap();
        tx.commit().unwrap();

        let mut command = CheckpointCommand::new();
        engine.collect_next_checkpoint(&mut command).unwrap();
        store.write_checkpoint(&command).await.unwrap();
        store.write_checkpoint(&command).await.unwrap();

        let rows = store.scan_table("Numbers").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].partition, 1);
        assert_eq!(rows[0].key, "\"one\"");
        assert_eq!(rows[0].value, serde_json::json!(1));

        let recovered = store.recover().await.unwrap();
        assert_eq!(recovered.last_checkpoint_id, Some(CheckpointId(1)));
        assert_eq!(recovered.partitions.len(), 2);
        assert_eq!(
            recovered.partitions[1].last_transaction_id,
            Some(TransactionId(1))
        );
    }
}
