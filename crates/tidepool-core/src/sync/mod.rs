// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrency primitives shared by the checkpoint worker and the work-item pipeline.
//!
//! Every blocking wait takes a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and reports cancellation as an ordinary outcome rather than an error.

mod partition_queue;
mod signal;
mod work_queue;

pub use self::partition_queue::{PartitionBatch, PartitionedWorkQueue};
pub use self::signal::{AsyncSignal, SignalWait};
pub use self::work_queue::WorkItemQueue;

/// Outcome of a bounded or cancellable dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue<T> {
    /// An item was available.
    Item(T),
    /// The caller's timeout elapsed first.
    TimedOut,
    /// The cancellation token fired first.
    Cancelled,
}

impl<T> Dequeue<T> {
    /// The dequeued item, if any.
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::TimedOut | Self::Cancelled => None,
        }
    }

    /// Whether the wait ended because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
