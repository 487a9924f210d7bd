//! In-process backend.
//!
//! Keeps an authoritative version and operation log per document, and can be
//! scripted to fail, stall or diverge so coordinator behaviour can be observed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use canopy_engine::{DocumentId, EditorOperation, Version};
use dashmap::DashMap;

use super::{PushBatch, SendOutcome, Transport, TransportError};

/// In-memory [`Transport`] with an authoritative per-document log.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    /// Accepted operations by document, in apply order.
    documents: DashMap<DocumentId, Vec<EditorOperation>>,
    /// Every accepted batch, in arrival order.
    accepted_batches: Mutex<Vec<PushBatch>>,
    /// Failures handed out to the next sends, oldest first.
    scripted: Mutex<VecDeque<TransportError>>,
    latency: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryTransport {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `count` sends fail with a network error.
    pub fn fail_next(&self, count: usize) {
        let mut scripted = lock(&self.scripted);
        for _ in 0..count {
            scripted.push_back(TransportError::Network("connection reset by peer".into()));
        }
    }

    /// Delay every send by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Append operations made elsewhere, moving the server version forward.
    pub fn apply_remote(&self, document_id: &str, operations: Vec<EditorOperation>) {
        self.documents
            .entry(document_id.to_string())
            .or_default()
            .extend(operations);
    }

    /// Current authoritative version of a document.
    pub fn version(&self, document_id: &str) -> Version {
        self.documents
            .get(document_id)
            .map(|ops| ops.len() as Version)
            .unwrap_or(0)
    }

    /// Operations accepted for a document, in apply order.
    pub fn operations(&self, document_id: &str) -> Vec<EditorOperation> {
        self.documents
            .get(document_id)
            .map(|ops| ops.clone())
            .unwrap_or_default()
    }

    /// Accepted batches, in arrival order.
    pub fn batches(&self) -> Vec<PushBatch> {
        lock(&self.accepted_batches).clone()
    }

    /// Accepted batches for one document.
    pub fn batches_for(&self, document_id: &str) -> Vec<PushBatch> {
        lock(&self.accepted_batches)
            .iter()
            .filter(|b| b.document_id == document_id)
            .cloned()
            .collect()
    }

    /// Sends attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Server versions of every known document.
    pub fn versions(&self) -> HashMap<DocumentId, Version> {
        self.documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len() as Version))
            .collect()
    }

    /// Highest number of sends observed in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        document_id: &str,
        version: Version,
        operations: &[EditorOperation],
    ) -> Result<SendOutcome, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(self);

        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = lock(&self.scripted).pop_front() {
            return Err(err);
        }

        let mut log = self.documents.entry(document_id.to_string()).or_default();
        let server_version = log.len() as Version;
        if server_version != version {
            let server_operations = log
                .iter()
                .skip(version.min(server_version) as usize)
                .cloned()
                .collect();
            return Ok(SendOutcome::Conflict {
                server_version,
                server_operations,
            });
        }

        log.extend_from_slice(operations);
        let new_version = log.len() as Version;
        drop(log);

        lock(&self.accepted_batches).push(PushBatch::new(
            document_id,
            version,
            operations.to_vec(),
        ));

        tracing::debug!(document_id, new_version, "Backend accepted batch");
        Ok(SendOutcome::Accepted { new_version })
    }
}

/// Tracks concurrent sends; released on drop so timed-out sends count too.
struct InFlight<'a>(&'a MemoryTransport);

impl<'a> InFlight<'a> {
    fn enter(transport: &'a MemoryTransport) -> Self {
        let now = transport.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(transport)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
