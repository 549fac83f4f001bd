// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only load figures for external autoscalers.

use serde::{Deserialize, Serialize};

/// Point-in-time load of one task hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadMetrics {
    /// Instances with messages waiting for dispatch.
    pub pending_dispatch_batches: usize,
    /// Instances currently being executed.
    pub in_flight_dispatches: usize,
    /// Messages waiting for dispatch.
    pub pending_messages: usize,
    /// Activities waiting for a worker.
    pub pending_activities: usize,
    /// Rows waiting for the next checkpoint.
    pub dirty_rows: usize,
    /// Partitions with commits not yet checkpointed.
    pub unflushed_partitions: usize,
    pub partition_count: u32,
}

impl LoadMetrics {
    /// Units of work that a replica could pick up.
    pub fn work_items(&self) -> usize {
        self.pending_dispatch_batches + self.in_flight_dispatches + self.pending_activities
    }

    /// Whether there is nothing to do, including nothing to flush.
    pub fn is_idle(&self) -> bool {
        self.work_items() == 0 && self.dirty_rows == 0 && self.unflushed_partitions == 0
    }
}

/// Tuning of [`recommended_replica_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSettings {
    /// Work one replica is expected to absorb.
    pub work_items_per_replica: usize,
    /// Upper bound regardless of load.
    pub max_replicas: usize,
}

impl Default for ScaleSettings {
    fn default() -> Self {
        Self {
            work_items_per_replica: 100,
            max_replicas: 16,
        }
    }
}

/// Number of replicas the current load calls for.
///
/// Zero when idle. Otherwise one replica per `work_items_per_replica` units of work,
/// at least one and never more than there are partitions or `max_replicas`.
pub fn recommended_replica_count(metrics: &LoadMetrics, settings: &ScaleSettings) -> usize {
    if metrics.is_idle() {
        return 0;
    }
    let per_replica = settings.work_items_per_replica.max(1);
    let wanted = metrics.work_items().div_ceil(per_replica);
    let ceiling = (metrics.partition_count.max(1) as usize)
        .min(settings.max_replicas)
        .max(1);
    wanted.clamp(1, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(work: usize) -> LoadMetrics {
        LoadMetrics {
            pending_dispatch_batches: work,
            partition_count: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_hub_needs_no_replicas() {
        assert_eq!(
            recommended_replica_count(&LoadMetrics::default(), &ScaleSettings::default()),
            0
        );
    }

    #[test]
    fn test_unflushed_state_keeps_one_replica() {
        let metrics = LoadMetrics {
            dirty_rows: 3,
            partition_count: 12,
            ..Default::default()
        };
        assert_eq!(
            recommended_replica_count(&metrics, &ScaleSettings::default()),
            1
        );
    }

    #[test]
    fn test_replicas_follow_work() {
        let settings = ScaleSettings::default();
        assert_eq!(recommended_replica_count(&metrics(1), &settings), 1);
        assert_eq!(recommended_replica_count(&metrics(100), &settings), 1);
        assert_eq!(recommended_replica_count(&metrics(101), &settings), 2);
        assert_eq!(recommended_replica_count(&metrics(450), &settings), 5);
    }

    #[test]
    fn test_replicas_are_capped() {
        let settings = ScaleSettings {
            work_items_per_replica: 10,
            max_replicas: 8,
        };
        assert_eq!(recommended_replica_count(&metrics(10_000), &settings), 8);

        let few_partitions = LoadMetrics {
            partition_count: 3,
            ..metrics(10_000)
        };
        assert_eq!(recommended_replica_count(&few_partitions, &settings), 3);
    }
}
