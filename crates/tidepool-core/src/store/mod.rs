// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable store boundary for checkpoints.
//!
//! The cache engine never talks to a database directly. Loads on cache miss go
//! through [`CheckpointStore::load_row`], and every durable write is one
//! [`CheckpointCommand`] handed to [`CheckpointStore::write_checkpoint`].

mod memory;
mod postgres;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use crate::cache::{CheckpointCommand, CheckpointId, PartitionId, PartitionMetaData};
use crate::config::Config;
use crate::error::Result;

/// A row as it was last written by a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Partition the row was written under.
    pub partition: PartitionId,
    /// JSON-encoded key.
    pub key: String,
    /// JSON value.
    pub value: serde_json::Value,
}

/// Progress the store had recorded when the process last stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveredState {
    /// Highest checkpoint that was written.
    pub last_checkpoint_id: Option<CheckpointId>,
    /// Stored metadata for every partition that was ever checkpointed.
    pub partitions: Vec<PartitionMetaData>,
}

/// Durable storage for checkpointed rows.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Write every delta, the partition metadata and a checkpoint record atomically.
    ///
    /// Writing the same command twice leaves the store in the same state as writing it once.
    async fn write_checkpoint(&self, command: &CheckpointCommand) -> Result<()>;

    /// Read one row, `None` if the store has no such row.
    async fn load_row(
        &self,
        table: &str,
        partition: PartitionId,
        key: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Read every stored row of a table.
    async fn scan_table(&self, table: &str) -> Result<Vec<StoredRow>>;

    /// Read the checkpoint progress recorded by earlier runs.
    async fn recover(&self) -> Result<RecoveredState>;

    /// Check whether the store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

/// Open the store named by `config.database_url` and run its migrations.
///
/// `sqlite:` URLs open a [`SqliteStore`], `postgres://` and `postgresql://` URLs a
/// [`PostgresStore`].
pub async fn connect(config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    let url = config.database_url.as_str();
    let lock_timeout = Duration::from_secs(config.lock_timeout_secs);

    if let Some(path) = url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        let path = path.split('?').next().unwrap_or(path);
        let store = SqliteStore::from_path(path, lock_timeout, &config.app_name).await?;
        Ok(Arc::new(store))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresStore::connect(url, lock_timeout, &config.app_name).await?;
        Ok(Arc::new(store))
    } else {
        Err(crate::error::CacheError::store(
            "connect",
            format!("unsupported database url scheme: {}", url),
        ))
    }
}

/// Decode a partition id read back from an integer column.
pub(crate) fn partition_from_db(value: i64) -> Result<PartitionId> {
    PartitionId::try_from(value).map_err(|_| {
        crate::error::CacheError::store("decode", format!("bad partition id {}", value))
    })
}

/// Convert an id to the signed column type both databases use.
pub(crate) fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| {
        crate::error::CacheError::store("encode", format!("id {} out of range", value))
    })
}

/// Convert a signed column back to an id.
pub(crate) fn from_db(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| crate::error::CacheError::store("decode", format!("bad id {}", value)))
}
