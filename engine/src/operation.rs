//! Editor operations - the unit of change queued for sync.
//!
//! Every local edit is expressed as an [`EditorOperation`]. Operations are
//! immutable once created and are owned by the document's queue until a flush
//! confirms them.

use crate::{DeviceId, DocumentId, Error, OperationId, Timestamp, UserId, Version};
use serde::{Deserialize, Serialize};

/// Metadata key holding the length of the span removed by delete/replace.
pub const SPAN_LENGTH_KEY: &str = "length";

/// What an operation does to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
    Format,
    Move,
    Annotation,
    Comment,
}

impl OperationKind {
    /// Whether the operation needs a non-empty content payload.
    pub fn requires_content(self) -> bool {
        matches!(
            self,
            OperationKind::Insert
                | OperationKind::Replace
                | OperationKind::Annotation
                | OperationKind::Comment
        )
    }
}

/// A single edit to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorOperation {
    /// Operation ID
    pub id: OperationId,
    /// What the operation does
    pub kind: OperationKind,
    /// Target character position
    pub position: usize,
    /// Content payload
    pub content: String,
    /// When the edit happened (milliseconds since epoch)
    pub timestamp: Timestamp,
    /// Device the edit originated on
    pub device_id: DeviceId,
    /// User who made the edit
    pub user_id: UserId,
    /// Document the edit belongs to
    pub document_id: DocumentId,
    /// Monotonically increasing per document
    pub version: Version,
    /// Preceding operation, for causal chaining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OperationId>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl EditorOperation {
    /// Create a new operation. Origin, version and timestamp default to empty
    /// values and are filled in with the `with_*` methods.
    pub fn new(
        id: impl Into<OperationId>,
        document_id: impl Into<DocumentId>,
        kind: OperationKind,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            content: content.into(),
            timestamp: 0,
            device_id: DeviceId::new(),
            user_id: UserId::new(),
            document_id: document_id.into(),
            version: 0,
            parent_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_origin(mut self, device_id: impl Into<DeviceId>, user_id: impl Into<UserId>) -> Self {
        self.device_id = device_id.into();
        self.user_id = user_id.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<OperationId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Number of characters removed by a delete or replace.
    ///
    /// Uses the `length` metadata entry when present, otherwise the char count
    /// of `content`. Other kinds remove nothing.
    pub fn span_len(&self) -> usize {
        match self.kind {
            OperationKind::Delete | OperationKind::Replace => self
                .metadata
                .get(SPAN_LENGTH_KEY)
                .and_then(serde_json::Value::as_u64)
                .map(|len| len as usize)
                .unwrap_or_else(|| self.content.chars().count()),
            _ => 0,
        }
    }

    /// Check the operation is well formed on its own.
    ///
    /// Ordering and bounds against a document are checked by
    /// [`crate::Document::validate`] and the queue.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |reason: &str| Error::InvalidOperation {
            op_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.is_empty() {
            return Err(invalid("missing operation id"));
        }
        if self.document_id.is_empty() {
            return Err(invalid("missing document id"));
        }
        if self.device_id.is_empty() {
            return Err(invalid("missing device id"));
        }
        if self.kind.requires_content() && self.content.is_empty() {
            return Err(invalid("content required"));
        }
        if self.kind == OperationKind::Delete && self.span_len() == 0 {
            return Err(invalid("delete removes nothing"));
        }
        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(invalid("operation cannot be its own parent"));
        }

        Ok(())
    }
}
