//! Local persistence of queues and sync state.
//!
//! Pending operations must survive a restart, so the coordinator writes a
//! [`QueueSnapshot`] and the current [`SyncState`] after every mutation and
//! reads them back when a document is registered.

mod file;
mod memory;

pub use file::JsonFilePersistence;
pub use memory::MemoryPersistence;

use async_trait::async_trait;
use canopy_engine::{QueueSnapshot, SyncState};

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] canopy_engine::Error),
}

/// Durable storage for per-document sync data.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Load the persisted queue of a document, if any.
    async fn load_queue(&self, document_id: &str)
        -> Result<Option<QueueSnapshot>, PersistenceError>;

    /// Load the persisted sync state of a document, if any.
    async fn load_sync_state(&self, document_id: &str)
        -> Result<Option<SyncState>, PersistenceError>;

    /// Replace the persisted queue and state of a document.
    async fn persist(
        &self,
        document_id: &str,
        queue: &QueueSnapshot,
        state: &SyncState,
    ) -> Result<(), PersistenceError>;

    /// Forget a document.
    async fn remove(&self, document_id: &str) -> Result<(), PersistenceError>;
}
