//! In-memory persistence, for tests and ephemeral sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use canopy_engine::{DocumentId, QueueSnapshot, SyncState};
use dashmap::DashMap;

use super::{Persistence, PersistenceError};

/// Keeps the latest snapshot of each document in a map.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    documents: DashMap<DocumentId, (QueueSnapshot, SyncState)>,
    writes: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of `persist` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether anything is stored for a document.
    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_queue(
        &self,
        document_id: &str,
    ) -> Result<Option<QueueSnapshot>, PersistenceError> {
        Ok(self
            .documents
            .get(document_id)
            .map(|stored| stored.0.clone()))
    }

    async fn load_sync_state(
        &self,
        document_id: &str,
    ) -> Result<Option<SyncState>, PersistenceError> {
        Ok(self
            .documents
            .get(document_id)
            .map(|stored| stored.1.clone()))
    }

    async fn persist(
        &self,
        document_id: &str,
        queue: &QueueSnapshot,
        state: &SyncState,
    ) -> Result<(), PersistenceError> {
        self.documents
            .insert(document_id.to_string(), (queue.clone(), state.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<(), PersistenceError> {
        self.documents.remove(document_id);
        Ok(())
    }
}
