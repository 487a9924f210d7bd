//! Builds operations for local edits.

use std::collections::HashMap;

use canopy_engine::{
    DeviceId, DocumentId, EditorOperation, OperationClock, OperationId, OperationKind, Timestamp,
    UserId, Version,
};

/// Stamps new operations with an id, the current time, the next clock version
/// and a causal link to the previous operation on the same document.
#[derive(Debug, Clone)]
pub struct OperationFactory {
    clock: OperationClock,
    user_id: UserId,
    last_op: HashMap<DocumentId, OperationId>,
}

impl OperationFactory {
    pub fn new(device_id: impl Into<DeviceId>, user_id: impl Into<UserId>) -> Self {
        Self {
            clock: OperationClock::new(device_id),
            user_id: user_id.into(),
            last_op: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.clock.device_id
    }

    /// Make sure future versions are above `version`, e.g. after a queue was
    /// restored from disk.
    pub fn observe(&mut self, version: Version) {
        self.clock.observe(version);
    }

    pub fn build(
        &mut self,
        document_id: impl Into<DocumentId>,
        kind: OperationKind,
        position: usize,
        content: impl Into<String>,
    ) -> EditorOperation {
        let document_id = document_id.into();
        let id = uuid::Uuid::new_v4().to_string();

        let mut op = EditorOperation::new(id.clone(), document_id.clone(), kind, position, content)
            .with_origin(self.clock.device_id.clone(), self.user_id.clone())
            .with_version(self.clock.tick())
            .with_timestamp(now_millis());
        if let Some(parent) = self.last_op.insert(document_id, id) {
            op = op.with_parent(parent);
        }
        op
    }

    pub fn insert(
        &mut self,
        document_id: impl Into<DocumentId>,
        position: usize,
        text: impl Into<String>,
    ) -> EditorOperation {
        self.build(document_id, OperationKind::Insert, position, text)
    }

    pub fn delete(
        &mut self,
        document_id: impl Into<DocumentId>,
        position: usize,
        removed: impl Into<String>,
    ) -> EditorOperation {
        self.build(document_id, OperationKind::Delete, position, removed)
    }
}

/// Wall-clock milliseconds since the epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
