// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue that groups items by key and hands out whole groups.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::Dequeue;
use crate::cache::lock;

/// Every item queued for one key at the time it was dequeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBatch<K, T> {
    /// The key the items were enqueued under.
    pub key: K,
    /// Items in enqueue order.
    pub items: Vec<T>,
}

#[derive(Debug)]
struct QueueState<K, T> {
    pending: HashMap<K, Vec<T>>,
    ready: VecDeque<K>,
    in_flight: HashSet<K>,
}

/// Partition-aware work queue.
///
/// A key is delivered to at most one consumer at a time. Items enqueued while the
/// key is in flight accumulate and become one new batch once the consumer calls
/// [`complete`](Self::complete).
#[derive(Debug)]
pub struct PartitionedWorkQueue<K, T> {
    state: Mutex<QueueState<K, T>>,
    ready: Semaphore,
}

impl<K, T> Default for PartitionedWorkQueue<K, T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                ready: VecDeque::new(),
                in_flight: HashSet::new(),
            }),
            ready: Semaphore::new(0),
        }
    }
}

impl<K, T> PartitionedWorkQueue<K, T>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item under `key`.
    pub fn enqueue(&self, key: K, item: T) {
        self.enqueue_many(key, std::iter::once(item));
    }

    /// Add several items under `key`, keeping their order.
    pub fn enqueue_many(&self, key: K, items: impl IntoIterator<Item = T>) {
        let mut state = lock(&self.state);
        let queued = state.pending.entry(key.clone()).or_default();
        let was_empty = queued.is_empty();
        queued.extend(items);
        if queued.is_empty() {
            state.pending.remove(&key);
            return;
        }
        if was_empty && !state.in_flight.contains(&key) {
            state.ready.push_back(key);
            self.ready.add_permits(1);
        }
    }

    /// Wait for the next ready key and take all of its items.
    pub async fn next_batch(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Dequeue<PartitionBatch<K, T>> {
        let acquired = match timeout {
            Some(timeout) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Dequeue::Cancelled,
                permit = self.ready.acquire() => permit,
                _ = tokio::time::sleep(timeout) => return Dequeue::TimedOut,
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Dequeue::Cancelled,
                permit = self.ready.acquire() => permit,
            },
        };
        let Ok(permit) = acquired else {
            return Dequeue::Cancelled;
        };
        permit.forget();

        let mut state = lock(&self.state);
        let Some(key) = state.ready.pop_front() else {
            return Dequeue::Cancelled;
        };
        let items = state.pending.remove(&key).unwrap_or_default();
        state.in_flight.insert(key.clone());
        Dequeue::Item(PartitionBatch { key, items })
    }

    /// Release `key`; items that arrived meanwhile become ready.
    pub fn complete(&self, key: &K) {
        let mut state = lock(&self.state);
        state.in_flight.remove(key);
        if state.pending.get(key).is_some_and(|items| !items.is_empty()) {
            state.ready.push_back(key.clone());
            self.ready.add_permits(1);
        }
    }

    /// Put a batch back ahead of anything enqueued since, then release its key.
    pub fn requeue(&self, batch: PartitionBatch<K, T>) {
        {
            let mut state = lock(&self.state);
            let queued = state.pending.entry(batch.key.clone()).or_default();
            let newer = std::mem::replace(queued, batch.items);
            queued.extend(newer);
        }
        self.complete(&batch.key);
    }

    /// Keys waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        lock(&self.state).ready.len()
    }

    /// Keys currently held by a consumer.
    pub fn in_flight_len(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Items not yet handed to a consumer.
    pub fn pending_items(&self) -> usize {
        lock(&self.state).pending.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_wait() -> Option<Duration> {
        Some(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_items_are_grouped_by_key() {
        let queue = PartitionedWorkQueue::new();
        let cancel = CancellationToken::new();

        queue.enqueue("a", 1);
        queue.enqueue("b", 2);
        queue.enqueue("a", 3);

        let first = queue.next_batch(no_wait(), &cancel).await.into_item().unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(first.items, vec![1, 3]);

        let second = queue.next_batch(no_wait(), &cancel).await.into_item().unwrap();
        assert_eq!(second.key, "b");
        assert_eq!(second.items, vec![2]);

        assert_eq!(queue.next_batch(no_wait(), &cancel).await, Dequeue::TimedOut);
    }

    #[tokio::test]
    async fn test_key_in_flight_is_not_redelivered() {
        let queue = PartitionedWorkQueue::new();
        let cancel = CancellationToken::new();

        queue.enqueue("a", 1);
        let batch = queue.next_batch(no_wait(), &cancel).await.into_item().unwrap();

        queue.enqueue("a", 2);
        assert_eq!(queue.next_batch(no_wait(), &cancel).await, Dequeue::TimedOut);
        assert_eq!(queue.pending_items(), 1);

        queue.complete(&batch.key);
        let next = queue.next_batch(no_wait(), &cancel).await.into_item().unwrap();
        assert_eq!(next.items, vec![2]);
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_keeps_original_items_first() {
        let queue = PartitionedWorkQueue::new();
        let cancel = CancellationToken::new();

        queue.enqueue("a", 1);
        let batch = queue.next_batch(no_wait(), &cancel).await.into_item().unwrap();
        queue.enqueue("a", 2);

        queue.requeue(batch);

        let again = queue.next_batch(no_wait(), &cancel).await.into_item().unwrap();
        assert_eq!(again.items, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_cancelled() {
        let queue: PartitionedWorkQueue<&str, u32> = PartitionedWorkQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(queue.next_batch(None, &cancel).await.is_cancelled());
    }
}
