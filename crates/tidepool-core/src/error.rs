// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tidepool-core.
//!
//! Invariant violations (touching rows that were never loaded, impossible write-back
//! transitions, checkpoint delta collisions) are programming errors and surface as
//! dedicated variants. Store failures are the only transient class and are retried
//! by the checkpoint worker.

use thiserror::Error;

use crate::cache::{CheckpointId, PartitionId, WriteBack};

/// Result type using CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the cache engine, the checkpoint path and the work-item pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The row was never loaded into the cache, so its existence is unknown.
    #[error("Row {key} in table '{table}' has not been loaded")]
    RowNotLoaded {
        /// Table name.
        table: String,
        /// Debug rendering of the key.
        key: String,
    },

    /// The row is known not to exist.
    #[error("Row {key} in table '{table}' does not exist")]
    RowNotFound {
        /// Table name.
        table: String,
        /// Debug rendering of the key.
        key: String,
    },

    /// The row is known to exist already.
    #[error("Row {key} in table '{table}' already exists")]
    RowAlreadyExists {
        /// Table name.
        table: String,
        /// Debug rendering of the key.
        key: String,
    },

    /// Two write-backs on the same row cannot be folded into one.
    #[error("Invalid write-back for row {key} in table '{table}': {earlier} followed by {later}")]
    InvalidTransition {
        /// Table name.
        table: String,
        /// Debug rendering of the key.
        key: String,
        /// The write-back already recorded.
        earlier: WriteBack,
        /// The write-back that was applied on top.
        later: WriteBack,
    },

    /// A checkpoint received two deltas for the same row.
    #[error("Checkpoint already holds a delta for row {key} in partition {partition} of table '{table}'")]
    DeltaCollision {
        /// Table name.
        table: String,
        /// Partition of the row.
        partition: PartitionId,
        /// Encoded key.
        key: String,
    },

    /// A checkpoint command can only be collected once.
    #[error("Checkpoint command was already collected as checkpoint {0}")]
    CommandAlreadyCollected(CheckpointId),

    /// A post-persistence callback was registered after the checkpoint completed.
    #[error("Checkpoint {0} has already been persisted")]
    CallbackAfterPersist(CheckpointId),

    /// A table with this name is already registered with the engine.
    #[error("Table '{0}' is already registered")]
    DuplicateTable(String),

    /// The table belongs to a different engine than the transaction.
    #[error("Table '{0}' belongs to a different cache engine")]
    ForeignTable(String),

    /// A history append did not line up with the stored history.
    #[error(
        "History conflict for instance '{instance_id}': append at position {expected}, history has {actual} events"
    )]
    HistoryConflict {
        /// The instance whose history was appended to.
        instance_id: String,
        /// Position the append was computed against.
        expected: usize,
        /// Actual number of events in the stored history.
        actual: usize,
    },

    /// An execution result arrived for an instance that already reached a final status.
    #[error("Instance '{instance_id}' is {status} and cannot be advanced")]
    InstanceFinished {
        /// The finished instance.
        instance_id: String,
        /// Its stored status.
        status: String,
    },

    /// A message did not have the shape the operation requires.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No execution cursor or record exists for the instance.
    #[error("Unknown instance '{0}'")]
    UnknownInstance(String),

    /// A value or key could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable store failed.
    #[error("Store error during '{operation}': {details}")]
    Store {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Internal invariant broken.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RowNotLoaded { .. } => "ROW_NOT_LOADED",
            Self::RowNotFound { .. } => "ROW_NOT_FOUND",
            Self::RowAlreadyExists { .. } => "ROW_ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::DeltaCollision { .. } => "DELTA_COLLISION",
            Self::CommandAlreadyCollected(_) => "COMMAND_ALREADY_COLLECTED",
            Self::CallbackAfterPersist(_) => "CALLBACK_AFTER_PERSIST",
            Self::DuplicateTable(_) => "DUPLICATE_TABLE",
            Self::ForeignTable(_) => "FOREIGN_TABLE",
            Self::HistoryConflict { .. } => "HISTORY_CONFLICT",
            Self::InstanceFinished { .. } => "INSTANCE_FINISHED",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::UnknownInstance(_) => "UNKNOWN_INSTANCE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Store { .. } => "STORE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. })
    }

    pub(crate) fn store(operation: &str, details: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::store("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for CacheError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CacheError::store("migrate", err)
    }
}
