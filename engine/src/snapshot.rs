//! Snapshot types for persisting and restoring a document's queue.
//!
//! Snapshots are the bridge between the in-memory queue and local persistence,
//! so pending operations survive a restart.

use crate::{error::Result, DocumentId, EditorOperation, Error, OperationQueue, Version};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time image of one document's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    pub document_id: DocumentId,
    /// Acknowledged document version the queued operations build on
    pub base_version: Version,
    /// Queued operations, oldest first
    pub operations: Vec<EditorOperation>,
}

impl QueueSnapshot {
    /// Capture a queue.
    pub fn capture(
        document_id: impl Into<DocumentId>,
        base_version: Version,
        queue: &OperationQueue,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            document_id: document_id.into(),
            base_version,
            operations: queue.iter().cloned().collect(),
        }
    }

    /// Check the snapshot can be restored for `document_id`.
    pub fn validate(&self, document_id: &str) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        if self.document_id != document_id {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot belongs to '{}', not '{}'",
                self.document_id, document_id
            )));
        }
        if let Some(stray) = self.operations.iter().find(|op| op.document_id != document_id) {
            return Err(Error::InvalidSnapshot(format!(
                "operation {} belongs to '{}'",
                stray.id, stray.document_id
            )));
        }
        Ok(())
    }

    /// Rebuild the queue.
    pub fn into_queue(self, document_id: &str) -> Result<OperationQueue> {
        self.validate(document_id)?;
        OperationQueue::from_operations(self.operations)
            .map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
