// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FIFO queue gated by a counting semaphore.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Dequeue;
use crate::cache::lock;

/// Thread-safe FIFO whose consumers suspend until an item is available.
///
/// The semaphore holds one permit per queued item, so a consumer that obtains a
/// permit is guaranteed to find an item to pop.
#[derive(Debug)]
pub struct WorkItemQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Semaphore,
}

impl<T> Default for WorkItemQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }
}

impl<T> WorkItemQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item and release one waiting consumer.
    pub fn enqueue(&self, item: T) {
        lock(&self.items).push_back(item);
        self.available.add_permits(1);
    }

    /// Pop the head of the queue without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        lock(&self.items).pop_front()
    }

    /// Wait for the next item, the timeout, or cancellation.
    pub async fn next(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Dequeue<T> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let acquired = match deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Dequeue::Cancelled,
                    permit = self.available.acquire() => permit,
                    _ = tokio::time::sleep_until(deadline) => return Dequeue::TimedOut,
                },
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Dequeue::Cancelled,
                    permit = self.available.acquire() => permit,
                },
            };

            let Ok(permit) = acquired else {
                return Dequeue::Cancelled;
            };
            permit.forget();
            if let Some(item) = lock(&self.items).pop_front() {
                return Dequeue::Item(item);
            }
            // Permit outlived its item after a drain; wait again.
        }
    }

    /// Like [`next`](Self::next), but folds timeout and cancellation into `None`.
    pub async fn get_next(&self, timeout: Duration, cancel: &CancellationToken) -> Option<T> {
        self.next(Some(timeout), cancel).await.into_item()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every queued item.
    pub fn drain(&self) -> Vec<T> {
        let mut items = lock(&self.items);
        let drained: Vec<T> = items.drain(..).collect();
        for _ in 0..drained.len() {
            match self.available.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
        drained
    }
}
