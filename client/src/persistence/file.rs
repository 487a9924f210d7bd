//! On-disk persistence: one JSON file per document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use canopy_engine::{QueueSnapshot, SyncState};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{Persistence, PersistenceError};

/// What a document's file holds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDocument {
    queue: QueueSnapshot,
    state: SyncState,
}

/// Stores `<dir>/<document id>.json`, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, document_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(document_id)))
    }

    async fn read(&self, document_id: &str) -> Result<Option<StoredDocument>, PersistenceError> {
        match fs::read(self.path_for(document_id)).await {
            Ok(bytes) => {
                let stored: StoredDocument = serde_json::from_slice(&bytes)?;
                stored.queue.validate(document_id)?;
                Ok(Some(stored))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Map a document id to a safe file stem.
fn file_stem(document_id: &str) -> String {
    document_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn load_queue(
        &self,
        document_id: &str,
    ) -> Result<Option<QueueSnapshot>, PersistenceError> {
        Ok(self.read(document_id).await?.map(|stored| stored.queue))
    }

    async fn load_sync_state(
        &self,
        document_id: &str,
    ) -> Result<Option<SyncState>, PersistenceError> {
        Ok(self.read(document_id).await?.map(|stored| stored.state))
    }

    async fn persist(
        &self,
        document_id: &str,
        queue: &QueueSnapshot,
        state: &SyncState,
    ) -> Result<(), PersistenceError> {
        let stored = StoredDocument {
            queue: queue.clone(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&stored)?;

        let path = self.path_for(document_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, document_id: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.path_for(document_id)).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
