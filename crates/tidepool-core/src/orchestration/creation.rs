// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deciding what a start request does to an existing instance.

use chrono::Utc;
use uuid::Uuid;

use super::types::{EventKind, InstanceRecord, InstanceStatus, TaskMessage};
use crate::error::{CacheError, Result};

/// Outcome of a creation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CreationDecision {
    /// An instance with a dedupe status exists; nothing is created.
    Deduplicate(InstanceStatus),
    /// Store this fresh record, replacing any existing instance.
    NewOrReplace(InstanceRecord),
}

/// Decide how a start message affects `existing`.
///
/// Fails with `InvalidMessage` unless `start` carries an `ExecutionStarted` event.
pub fn handle_creation_request(
    existing: Option<&InstanceRecord>,
    start: &TaskMessage,
    dedupe_statuses: &[InstanceStatus],
) -> Result<CreationDecision> {
    let EventKind::ExecutionStarted {
        name,
        version,
        input,
    } = &start.event.kind
    else {
        return Err(CacheError::InvalidMessage(format!(
            "creation request for '{}' does not start an execution",
            start.instance_id
        )));
    };

    if let Some(existing) = existing
        && dedupe_statuses.contains(&existing.status)
    {
        return Ok(CreationDecision::Deduplicate(existing.status));
    }

    let now = Utc::now();
    Ok(CreationDecision::NewOrReplace(InstanceRecord {
        instance_id: start.instance_id.clone(),
        execution_id: start
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: name.clone(),
        version: version.clone(),
        status: InstanceStatus::Pending,
        input: input.clone(),
        output: None,
        created_at: now,
        last_updated_at: now,
        completed_at: None,
    }))
}
