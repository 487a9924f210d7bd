//! Per-document sync state and its transitions.
//!
//! ```text
//! pending --(flush starts)--> syncing
//! syncing --(success, queue empty)--> synced
//! syncing --(success, queue non-empty)--> pending
//! syncing --(failure)--> error | conflict
//! any --(operation enqueued)--> pending
//! ```
//!
//! Every transition takes the live queue length so `pending_operations`
//! never drifts from the queue.

use crate::{
    DeviceId, EditorOperation, FailureKind, RetryPolicy, SyncFailure, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sync status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Conflict,
    Offline,
    Error,
    Syncing,
}

/// Estimated connection quality of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
    #[default]
    Unknown,
}

/// What is known about one device editing the document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncState {
    /// Last time the device was seen (milliseconds since epoch)
    pub last_seen: Timestamp,
    /// Last document version the device is known to hold
    pub version: Version,
    /// Operations from this device still queued
    pub pending_operations: usize,
    pub online: bool,
    pub network_quality: NetworkQuality,
}

/// Externally observable sync state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    /// Always equal to the document's queue length when read
    pub pending_operations: usize,
    /// Last successful sync (milliseconds since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<Timestamp>,
    /// Consecutive failed flushes
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SyncFailure>,
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceSyncState>,
}

impl SyncState {
    /// Initial state for a freshly registered document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the document has nothing left to send.
    pub fn is_synced(&self) -> bool {
        self.status == SyncStatus::Synced && self.pending_operations == 0
    }

    /// A local operation was appended to the queue.
    pub fn mark_enqueued(&mut self, op: &EditorOperation, queue_len: usize) {
        self.status = SyncStatus::Pending;
        self.pending_operations = queue_len;

        let device = self.devices.entry(op.device_id.clone()).or_default();
        device.last_seen = device.last_seen.max(op.timestamp);
        device.pending_operations += 1;
        device.online = true;
    }

    /// A flush drained a batch and is about to hit the backend.
    pub fn mark_syncing(&mut self, queue_len: usize) {
        self.status = SyncStatus::Syncing;
        self.pending_operations = queue_len;
    }

    /// The backend accepted `batch`.
    pub fn mark_synced(
        &mut self,
        batch: &[EditorOperation],
        version: Version,
        queue_len: usize,
        now: Timestamp,
    ) {
        self.status = if queue_len == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };
        self.pending_operations = queue_len;
        self.last_synced_at = Some(now);
        self.retry_count = 0;
        self.last_error = None;

        for op in batch {
            if let Some(device) = self.devices.get_mut(&op.device_id) {
                device.pending_operations = device.pending_operations.saturating_sub(1);
                device.version = device.version.max(version);
            }
        }
    }

    /// Operations left the queue without a flush.
    pub fn mark_drained(&mut self, drained: &[EditorOperation], queue_len: usize) {
        self.pending_operations = queue_len;
        for op in drained {
            if let Some(device) = self.devices.get_mut(&op.device_id) {
                device.pending_operations = device.pending_operations.saturating_sub(1);
            }
        }
    }

    /// The flush failed; the batch has already been requeued.
    pub fn mark_failed(&mut self, failure: SyncFailure, queue_len: usize) {
        self.status = match failure.kind {
            FailureKind::VersionConflict => SyncStatus::Conflict,
            FailureKind::Network | FailureKind::Timeout => SyncStatus::Error,
        };
        self.pending_operations = queue_len;
        if failure.kind.is_retryable() {
            self.retry_count += 1;
        }
        self.last_error = Some(failure);
    }

    /// Give a document whose retries ran out a fresh budget.
    ///
    /// Returns whether the budget was renewed.
    pub fn renew_retries(&mut self, policy: &RetryPolicy) -> bool {
        if self.retry_count == 0 || policy.allows(self.retry_count) {
            return false;
        }
        self.retry_count = 0;
        true
    }

    /// A flush was attempted while the client has no connectivity.
    pub fn mark_offline(&mut self, queue_len: usize) {
        self.status = SyncStatus::Offline;
        self.pending_operations = queue_len;
    }

    /// A conflict was resolved above the core; the queue can be sent again.
    pub fn mark_resolved(&mut self, queue_len: usize) {
        self.status = if queue_len == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };
        self.pending_operations = queue_len;
        self.last_error = None;
    }

    /// Record presence information reported for a device.
    pub fn update_device(&mut self, device_id: impl Into<DeviceId>, update: DeviceSyncState) {
        let device_id = device_id.into();
        let pending = self
            .devices
            .get(&device_id)
            .map(|d| d.pending_operations)
            .unwrap_or_default();
        // Pending counts are owned by the queue, not by the reporter.
        self.devices.insert(
            device_id,
            DeviceSyncState {
                pending_operations: pending,
                ..update
            },
        );
    }
}
