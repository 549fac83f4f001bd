// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row write-back kinds and the fold that reduces them.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bounds every table key satisfies.
pub trait RowKey:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> RowKey for T where
    T: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds every table value satisfies.
pub trait RowValue: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> RowValue for T where T: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// How a row changed relative to the last checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteBack {
    /// No net change.
    #[default]
    None,
    /// The row did not exist in the store and must be inserted.
    Created,
    /// The row exists in the store and must be overwritten.
    Updated,
    /// The row exists in the store and must be removed.
    Deleted,
}

impl WriteBack {
    /// String form used in logs and store records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    /// Fold a later write-back onto this one.
    ///
    /// Returns `None` for transitions that cannot happen on a consistent row
    /// (creating a row twice, touching a row after deleting it).
    pub fn then(self, later: WriteBack) -> Option<WriteBack> {
        use WriteBack::*;
        match (self, later) {
            (None, next) => Some(next),
            (earlier, None) => Some(earlier),
            (Created, Updated) => Some(Created),
            (Created, Deleted) => Some(None),
            (Updated, Updated) => Some(Updated),
            (Updated, Deleted) => Some(Deleted),
            (Deleted, Created) => Some(Updated),
            (Created, Created) | (Updated, Created) | (Deleted, Updated) | (Deleted, Deleted) => {
                Option::None
            }
        }
    }
}

impl fmt::Display for WriteBack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction's reduced write on one row.
#[derive(Debug, Clone)]
pub(crate) struct PendingRow<V> {
    /// Value after the transaction; `None` once deleted.
    pub value: Option<V>,
    pub write_back: WriteBack,
}
