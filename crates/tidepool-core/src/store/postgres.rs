// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed checkpoint store.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, instrument};

use super::{CheckpointStore, RecoveredState, StoredRow, from_db, partition_from_db, to_db};
use crate::cache::{
    CheckpointCommand, CheckpointId, PartitionId, PartitionMetaData, TransactionId, WriteBack,
};
use crate::error::{CacheError, Result};
use crate::migrations;

/// PostgreSQL-backed checkpoint store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout: Duration,
    app_name: String,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("lock_timeout", &self.lock_timeout)
            .field("app_name", &self.app_name)
            .finish()
    }
}

impl PostgresStore {
    /// Create a store from a pool whose schema is already migrated.
    pub fn new(pool: PgPool, lock_timeout: Duration, app_name: &str) -> Self {
        Self {
            pool,
            lock_timeout,
            app_name: app_name.to_string(),
        }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str, lock_timeout: Duration, app_name: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(lock_timeout)
            .connect(url)
            .await
            .map_err(|e| {
                CacheError::store("connect", format!("Failed to connect to PostgreSQL: {}", e))
            })?;

        migrations::run_postgres(&pool).await?;

        Ok(Self::new(pool, lock_timeout, app_name))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for PostgresStore {
    #[instrument(skip(self, command), fields(checkpoint_id = ?command.checkpoint_id()))]
    async fn write_checkpoint(&self, command: &CheckpointCommand) -> Result<()> {
        let checkpoint_id = command
            .checkpoint_id()
            .ok_or_else(|| CacheError::Internal("checkpoint command was never collected".into()))?;
        let checkpoint = to_db(checkpoint_id.0)?;

        let mut tx = self.pool.begin().await?;

        let set_lock_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&set_lock_timeout).execute(&mut *tx).await?;

        for delta in command.deltas() {
            match (delta.write_back, &delta.value) {
                (WriteBack::Created | WriteBack::Updated, Some(value)) => {
                    sqlx::query(
                        r#"
                        INSERT INTO rows (table_name, partition_id, row_key, value, updated_checkpoint)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (table_name, row_key) DO UPDATE SET
                            partition_id = EXCLUDED.partition_id,
                            value = EXCLUDED.value,
                            updated_checkpoint = EXCLUDED.updated_checkpoint
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
                    sqlx::query("DELETE FROM rows WHERE table_name = $1 AND row_key = $2")
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
                VALUES ($1, $2, $3)
                ON CONFLICT (partition_id) DO UPDATE SET
                    last_checkpoint_id = EXCLUDED.last_checkpoint_id,
                    last_transaction_id = EXCLUDED.last_transaction_id
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (checkpoint_id) DO UPDATE SET
                through_transaction = EXCLUDED.through_transaction,
                row_count = EXCLUDED.row_count,
                written_by = EXCLUDED.written_by
            "#,
        )
        .bind(checkpoint)
        .bind(command.through_transaction().map(|id| to_db(id.0)).transpose()?)
        .bind(command.row_count() as i64)
        .bind(&self.app_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(rows = command.row_count(), "Checkpoint written to PostgreSQL");
        Ok(())
    }

    async fn load_row(
        &self,
        table: &str,
        _partition: PartitionId,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM rows WHERE table_name = $1 AND row_key = $2")
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
            WHERE table_name = $1
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
        let result: std::result::Result<(i32,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
