//! Batch wire format.
//!
//! Batches and outcomes are JSON-encoded with camelCase field names and a
//! `type` tag on outcomes.

use canopy_engine::{DocumentId, EditorOperation, Version};
use serde::{Deserialize, Serialize};

/// A batch pushed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBatch {
    pub document_id: DocumentId,
    /// Version the operations were built on
    pub base_version: Version,
    /// Operations in enqueue order
    pub operations: Vec<EditorOperation>,
}

impl PushBatch {
    pub fn new(
        document_id: impl Into<DocumentId>,
        base_version: Version,
        operations: Vec<EditorOperation>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            base_version,
            operations,
        }
    }
}

/// The backend's answer to a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SendOutcome {
    /// Batch applied; the document is now at `new_version`
    #[serde(rename_all = "camelCase")]
    Accepted { new_version: Version },

    /// The backend is at a different version than the batch was built on
    #[serde(rename_all = "camelCase")]
    Conflict {
        server_version: Version,
        /// Operations the client has not seen yet
        server_operations: Vec<EditorOperation>,
    },
}
