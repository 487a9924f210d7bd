//! Document types - the content snapshot an operation queue belongs to.

use crate::{
    error::Result, DeviceId, DocumentId, EditorOperation, Error, OperationKind, SyncStatus,
    Timestamp, UserId, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Access level a user holds on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

/// Metadata associated with a document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Free-form tags (species, site, survey round)
    #[serde(default)]
    pub tags: Vec<String>,
    /// Permissions by user
    #[serde(default)]
    pub permissions: BTreeMap<UserId, Permission>,
    /// Last known sync status
    #[serde(default)]
    pub sync_status: SyncStatus,
}

/// A document under sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier for this document
    pub id: DocumentId,
    /// Display title
    pub title: String,
    /// Local content snapshot
    pub content: String,
    /// Last version acknowledged by the backend
    pub version: Version,
    /// Document metadata
    pub metadata: DocumentMetadata,
    /// When the document was created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the document was last modified (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Device that made the last modification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<DeviceId>,
}

impl Document {
    /// Create an empty document at version 0.
    pub fn new(id: impl Into<DocumentId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            version: 0,
            metadata: DocumentMetadata::default(),
            created_at: 0,
            updated_at: 0,
            last_modified_by: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_created_at(mut self, timestamp: Timestamp) -> Self {
        self.created_at = timestamp;
        self.updated_at = timestamp;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    /// Content length in characters.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Check that an operation can be applied to the current content.
    pub fn validate(&self, op: &EditorOperation) -> Result<()> {
        if op.document_id != self.id {
            return Err(Error::InvalidOperation {
                op_id: op.id.clone(),
                reason: format!("targets document {}, not {}", op.document_id, self.id),
            });
        }

        // Covers the insert point as well as the removed span.
        let len = self.len();
        let end = op.position.saturating_add(op.span_len());
        if end > len {
            return Err(Error::PositionOutOfBounds { position: end, len });
        }

        Ok(())
    }

    /// Apply a validated local operation to the content snapshot.
    ///
    /// The acknowledged `version` is untouched; it only moves when the backend
    /// accepts a batch, see [`Document::advance_to`].
    pub fn apply(&mut self, op: &EditorOperation) -> Result<()> {
        self.validate(op)?;

        match op.kind {
            OperationKind::Insert => {
                let at = byte_offset(&self.content, op.position);
                self.content.insert_str(at, &op.content);
            }
            OperationKind::Delete => {
                let start = byte_offset(&self.content, op.position);
                let end = byte_offset(&self.content, op.position + op.span_len());
                self.content.replace_range(start..end, "");
            }
            OperationKind::Replace => {
                let start = byte_offset(&self.content, op.position);
                let end = byte_offset(&self.content, op.position + op.span_len());
                self.content.replace_range(start..end, &op.content);
            }
            OperationKind::Format
            | OperationKind::Move
            | OperationKind::Annotation
            | OperationKind::Comment => {}
        }

        self.updated_at = self.updated_at.max(op.timestamp);
        self.last_modified_by = Some(op.device_id.clone());
        Ok(())
    }

    /// Move the acknowledged version forward.
    pub fn advance_to(&mut self, version: Version) -> Result<()> {
        if version < self.version {
            return Err(Error::VersionMismatch {
                expected: self.version,
                actual: version,
            });
        }
        self.version = version;
        Ok(())
    }
}

/// Byte offset of the `chars`-th character, or the end of the string.
fn byte_offset(content: &str, chars: usize) -> usize {
    content
        .char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len())
}
