// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Auto-reset async signal.

use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How a [`AsyncSignal::wait`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalWait {
    /// The signal was set; it is reset again.
    Signaled,
    /// The timeout elapsed.
    TimedOut,
    /// The token was cancelled.
    Cancelled,
}

/// A signal that releases exactly one waiter per `set` and then resets.
///
/// Setting an already-set signal is a no-op, so a burst of `set` calls before the
/// waiter wakes collapses into a single wake-up.
#[derive(Debug, Default)]
pub struct AsyncSignal {
    notify: Notify,
}

impl AsyncSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal.
    pub fn set(&self) {
        self.notify.notify_one();
    }

    /// Wait for the signal, an optional timeout, or cancellation.
    pub async fn wait(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> SignalWait {
        let notified = self.notify.notified();
        match timeout {
            Some(timeout) => tokio::select! {
                biased;
                _ = cancel.cancelled() => SignalWait::Cancelled,
                _ = notified => SignalWait::Signaled,
                _ = tokio::time::sleep(timeout) => SignalWait::TimedOut,
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => SignalWait::Cancelled,
                _ = notified => SignalWait::Signaled,
            },
        }
    }
}
