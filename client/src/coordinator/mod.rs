//! Sync coordinator.
//!
//! [`SyncEngine`] owns every registered document's queue and state and moves
//! queued operations to the backend. Flushes are serialized per document and
//! run concurrently across documents. A failed flush puts its batch back at
//! the head of the queue and schedules a retry with exponential backoff; a
//! version conflict is handed back to the caller instead.
//!
//! Flushes are triggered by queue size on enqueue, by a periodic ticker, by
//! explicit [`SyncEngine::force_sync`] calls and by retry timers.

mod slot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use canopy_engine::{
    DeviceSyncState, Document, DocumentId, EditorOperation, Error as EngineError, FlushPolicy,
    FlushReason, FlushStart, RetryPolicy, SyncEntry, SyncFailure, SyncState, SyncStatus, Version,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::factory::now_millis;
use crate::persistence::Persistence;
use crate::transport::{SendOutcome, Transport};

use slot::{DocumentSlot, FlushTicket};

/// Result of registering a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Newly tracked; `restored` operations were loaded from persistence and
    /// new operations must be stamped above `last_version`
    Registered {
        restored: usize,
        last_version: Version,
    },
    /// Already tracked; queue and state were left untouched
    AlreadyRegistered,
}

/// Result of queueing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReceipt {
    /// Queue length after the operation was added
    pub pending: usize,
    /// Flush requested by this enqueue, if any
    pub trigger: Option<FlushReason>,
}

/// Result of a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// The queue was empty
    Idle,
    /// The backend accepted `sent` operations
    Synced {
        sent: usize,
        version: Version,
        remaining: usize,
    },
    /// No connectivity; nothing was drained
    Offline,
    /// Network error or timeout; the batch is back in the queue
    Failed {
        failure: SyncFailure,
        /// When the next automatic attempt happens; `None` once retries are spent
        retry_in: Option<Duration>,
    },
    /// The backend is at another version; the batch is back in the queue
    Conflict {
        server_version: Version,
        server_operations: Vec<EditorOperation>,
    },
    /// The document was unregistered before the flush could run
    Closed,
    /// A retry found the document waiting on conflict resolution; nothing was sent
    AwaitingResolution,
}

struct Inner {
    config: SyncConfig,
    policy: FlushPolicy,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    documents: DashMap<DocumentId, Arc<DocumentSlot>>,
    online: AtomicBool,
    shutdown: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the sync coordinator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.inner.config)
            .field("documents", &self.inner.documents.len())
            .field("online", &self.is_online())
            .finish()
    }
}

impl SyncEngine {
    /// Create a coordinator. Call [`SyncEngine::start`] to run the periodic ticker.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                policy: config.flush_policy(),
                config,
                transport,
                persistence,
                documents: DashMap::new(),
                online: AtomicBool::new(true),
                shutdown,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.config.retry
    }

    fn slot(&self, document_id: &str) -> Result<Arc<DocumentSlot>> {
        self.inner
            .documents
            .get(document_id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| EngineError::UnregisteredDocument(document_id.to_string()).into())
    }

    fn slots(&self) -> Vec<Arc<DocumentSlot>> {
        self.inner
            .documents
            .iter()
            .map(|slot| slot.value().clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Start syncing a document.
    ///
    /// A queue persisted for the document is restored. Registering a document
    /// twice is a no-op: the existing queue and state are kept.
    pub async fn register_document(&self, document: Document) -> Result<Registration> {
        if self.inner.documents.contains_key(&document.id) {
            return Ok(Registration::AlreadyRegistered);
        }

        let snapshot = self.inner.persistence.load_queue(&document.id).await?;
        let state = self.inner.persistence.load_sync_state(&document.id).await?;
        let entry = SyncEntry::restore(document, snapshot, state)?;
        let restored = entry.queue_len();
        let last_version = entry.last_version();
        let slot = DocumentSlot::new(entry);

        match self.inner.documents.entry(slot.id.clone()) {
            Entry::Occupied(_) => return Ok(Registration::AlreadyRegistered),
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
            }
        }

        info!(document_id = %slot.id, restored, last_version, "Document registered");

        self.persist(&slot).await;
        if let Some(reason) = self.inner.policy.on_enqueue(restored) {
            self.schedule_flush(&slot, reason);
        }
        Ok(Registration::Registered {
            restored,
            last_version,
        })
    }

    /// Stop syncing a document.
    ///
    /// Waits for an in-flight flush, cancels the retry timer, clears the
    /// persisted queue and returns the operations that never reached the
    /// backend, oldest first.
    pub async fn unregister_document(&self, document_id: &str) -> Result<Vec<EditorOperation>> {
        let (_, slot) = self
            .inner
            .documents
            .remove(document_id)
            .ok_or_else(|| EngineError::UnregisteredDocument(document_id.to_string()))?;

        slot.cancel_retry();
        let _flush = slot.flush_lock.lock().await;
        slot.close();
        let undelivered = slot.update(|entry| entry.drain(usize::MAX));

        {
            let _persist = slot.persist_lock.lock().await;
            self.inner.persistence.remove(document_id).await?;
        }

        if undelivered.is_empty() {
            info!(document_id, "Document unregistered");
        } else {
            warn!(
                document_id,
                undelivered = undelivered.len(),
                "Document unregistered with unsynced operations"
            );
        }
        Ok(undelivered)
    }

    pub fn is_registered(&self, document_id: &str) -> bool {
        self.inner.documents.contains_key(document_id)
    }

    /// Ids of all registered documents.
    pub fn document_ids(&self) -> Vec<DocumentId> {
        self.inner
            .documents
            .iter()
            .map(|slot| slot.key().clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Validate, apply locally and queue an operation, then evaluate the
    /// batch-size trigger.
    pub async fn queue_operation(&self, op: EditorOperation) -> Result<EnqueueReceipt> {
        let slot = self.slot(&op.document_id)?;
        let op_id = op.id.clone();
        let retry = self.retry_policy();
        let (pending, renewed) = slot.update(|entry| {
            let pending = entry.enqueue(op)?;
            Ok::<_, EngineError>((pending, entry.renew_retries(&retry)))
        })?;
        if renewed {
            debug!(document_id = %slot.id, "Retry budget renewed by new edit");
        }
        self.persist(&slot).await;

        let trigger = self.inner.policy.on_enqueue(pending);
        debug!(document_id = %slot.id, op_id = %op_id, pending, ?trigger, "Operation queued");
        if let Some(reason) = trigger {
            self.schedule_flush(&slot, reason);
        }

        Ok(EnqueueReceipt { pending, trigger })
    }

    /// Remove up to `max` operations from the head of a queue and hand them to
    /// the caller. Unknown documents yield nothing.
    pub async fn drain(&self, document_id: &str, max: usize) -> Vec<EditorOperation> {
        let Ok(slot) = self.slot(document_id) else {
            return Vec::new();
        };
        let drained = slot.update(|entry| entry.drain(max));
        if !drained.is_empty() {
            self.persist(&slot).await;
        }
        drained
    }

    /// Highest version queued on a document, so a fresh
    /// [`crate::OperationFactory`] can continue above it after a restart.
    pub fn last_version(&self, document_id: &str) -> Option<Version> {
        self.slot(document_id)
            .ok()
            .map(|slot| slot.read(|entry| entry.last_version()))
    }

    /// Current queue length; 0 for unknown documents.
    pub fn queue_length(&self, document_id: &str) -> usize {
        self.slot(document_id)
            .map(|slot| slot.read(|entry| entry.queue_len()))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn get_sync_state(&self, document_id: &str) -> Option<SyncState> {
        self.slot(document_id)
            .ok()
            .map(|slot| slot.read(|entry| entry.state().clone()))
    }

    /// Local snapshot of a document, including unsynced edits.
    pub fn get_document(&self, document_id: &str) -> Option<Document> {
        self.slot(document_id)
            .ok()
            .map(|slot| slot.read(|entry| entry.document().clone()))
    }

    /// Watch a document's sync state. The receiver closes when the document
    /// is unregistered.
    pub fn subscribe(&self, document_id: &str) -> Result<watch::Receiver<SyncState>> {
        Ok(self.slot(document_id)?.subscribe())
    }

    /// Record presence information reported for a device.
    pub fn record_device_presence(
        &self,
        document_id: &str,
        device_id: &str,
        presence: DeviceSyncState,
    ) -> Result<()> {
        self.slot(document_id)?
            .update(|entry| entry.update_device(device_id, presence));
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Switch connectivity. Going offline marks documents with queued work as
    /// offline; coming back online flushes them.
    pub fn set_online(&self, online: bool) {
        if self.inner.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        info!(online, "Connectivity changed");

        for slot in self.slots() {
            let pending = slot.read(|entry| entry.queue_len());
            if pending == 0 {
                continue;
            }
            if online {
                self.schedule_flush(&slot, FlushReason::Reconnect);
            } else if !slot.read(|entry| entry.is_in_flight()) {
                slot.update(|entry| entry.mark_offline());
            }
        }
    }

    /// Adopt the backend's version after a conflict was resolved above the
    /// core, and flush what is still queued.
    pub async fn resolve_conflict(&self, document_id: &str, server_version: Version) -> Result<()> {
        let slot = self.slot(document_id)?;
        {
            let _flush = slot.flush_lock.lock().await;
            slot.update(|entry| entry.resolve_conflict(server_version));
        }
        self.persist(&slot).await;
        info!(document_id, server_version, "Conflict resolved");

        if slot.read(|entry| entry.queue_len()) > 0 {
            self.schedule_flush(&slot, FlushReason::Explicit);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Flush one batch now, waiting behind an in-flight flush of the same
    /// document.
    pub async fn flush(&self, document_id: &str, reason: FlushReason) -> Result<FlushOutcome> {
        let slot = self.slot(document_id)?;
        let _ticket = FlushTicket::new(&slot);
        if reason == FlushReason::Explicit {
            self.renew_retries(&slot);
        }
        Ok(self.run_flush(&slot, reason).await)
    }

    /// Flush until the queue is empty or a batch fails ("save now").
    pub async fn force_sync(&self, document_id: &str) -> Result<FlushOutcome> {
        let slot = self.slot(document_id)?;
        let _ticket = FlushTicket::new(&slot);
        self.renew_retries(&slot);
        let _flush = slot.flush_lock.lock().await;
        if slot.is_closed() {
            return Ok(FlushOutcome::Closed);
        }

        let mut total = 0;
        loop {
            match self.flush_locked(&slot, FlushReason::Explicit).await {
                FlushOutcome::Synced {
                    sent,
                    version,
                    remaining,
                } => {
                    total += sent;
                    if remaining == 0 {
                        return Ok(FlushOutcome::Synced {
                            sent: total,
                            version,
                            remaining,
                        });
                    }
                }
                FlushOutcome::Idle if total > 0 => {
                    let version = slot.read(|entry| entry.document().version);
                    return Ok(FlushOutcome::Synced {
                        sent: total,
                        version,
                        remaining: 0,
                    });
                }
                other => return Ok(other),
            }
        }
    }

    /// Force-sync every registered document concurrently.
    pub async fn force_sync_all(&self) -> Vec<(DocumentId, Result<FlushOutcome>)> {
        let ids = self.document_ids();
        let outcomes = join_all(ids.iter().map(|id| self.force_sync(id))).await;
        ids.into_iter().zip(outcomes).collect()
    }

    /// Wait until no flush or retry is scheduled or running for a document.
    pub async fn settle(&self, document_id: &str) {
        if let Ok(slot) = self.slot(document_id) {
            slot.settle().await;
        }
    }

    /// An explicit request gives a document whose retries ran out a new budget.
    fn renew_retries(&self, slot: &Arc<DocumentSlot>) {
        let retry = self.retry_policy();
        if slot.update(|entry| entry.renew_retries(&retry)) {
            debug!(document_id = %slot.id, "Retry budget renewed by explicit flush");
        }
    }

    /// Request a background flush. A request that has not started yet absorbs
    /// later ones, since it will drain the queue as it is when it runs.
    fn schedule_flush(&self, slot: &Arc<DocumentSlot>, reason: FlushReason) -> bool {
        if !slot.request_flush() {
            debug!(document_id = %slot.id, ?reason, "Flush already requested");
            return false;
        }

        let ticket = FlushTicket::new(slot);
        let engine = self.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            let _ticket = ticket;
            let outcome = engine.run_flush(&slot, reason).await;
            debug!(document_id = %slot.id, ?reason, ?outcome, "Background flush finished");
        });
        true
    }

    async fn run_flush(&self, slot: &Arc<DocumentSlot>, reason: FlushReason) -> FlushOutcome {
        let _flush = slot.flush_lock.lock().await;
        slot.clear_request();
        if slot.is_closed() {
            return FlushOutcome::Closed;
        }
        if matches!(reason, FlushReason::Retry { .. })
            && slot.read(|entry| entry.state().status) == SyncStatus::Conflict
        {
            debug!(document_id = %slot.id, ?reason, "Retry skipped, conflict unresolved");
            return FlushOutcome::AwaitingResolution;
        }

        let outcome = self.flush_locked(slot, reason).await;
        if let FlushOutcome::Synced { remaining, .. } = outcome {
            if let Some(next) = self.inner.policy.after_flush(remaining) {
                self.schedule_flush(slot, next);
            }
        }
        outcome
    }

    /// Drain, send and confirm one batch. Caller holds `flush_lock`.
    async fn flush_locked(&self, slot: &Arc<DocumentSlot>, reason: FlushReason) -> FlushOutcome {
        if !self.is_online() {
            slot.update(|entry| entry.mark_offline());
            self.persist(slot).await;
            debug!(document_id = %slot.id, ?reason, "Offline, flush deferred");
            return FlushOutcome::Offline;
        }

        let start = slot.update(|entry| entry.begin_flush(self.inner.policy.batch_size, now_millis()));
        let (operations, base_version) = match start {
            FlushStart::Empty => {
                self.persist(slot).await;
                return FlushOutcome::Idle;
            }
            FlushStart::Batch {
                operations,
                base_version,
            } => (operations, base_version),
        };
        // The snapshot still holds the in-flight batch, so a crash here loses nothing.
        self.persist(slot).await;

        let sent = operations.len();
        debug!(document_id = %slot.id, ?reason, sent, base_version, "Flushing batch");

        let timeout = self.inner.config.flush_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.inner
                .transport
                .send(&slot.id, base_version, &operations),
        )
        .await;

        let outcome = match result {
            Ok(Ok(SendOutcome::Accepted { new_version })) => {
                match slot.update(|entry| entry.complete_flush(new_version, now_millis())) {
                    Ok(confirmed) => {
                        slot.cancel_retry();
                        let remaining = slot.read(|entry| entry.queue_len());
                        info!(
                            document_id = %slot.id,
                            ?reason,
                            sent = confirmed,
                            version = new_version,
                            remaining,
                            "Batch synced"
                        );
                        FlushOutcome::Synced {
                            sent: confirmed,
                            version: new_version,
                            remaining,
                        }
                    }
                    Err(err) => {
                        slot.cancel_retry();
                        warn!(
                            document_id = %slot.id,
                            error = %err,
                            sent,
                            "Backend accepted batch at an older version"
                        );
                        FlushOutcome::Conflict {
                            server_version: new_version,
                            server_operations: Vec::new(),
                        }
                    }
                }
            }
            Ok(Ok(SendOutcome::Conflict {
                server_version,
                server_operations,
            })) => {
                slot.update(|entry| {
                    entry.fail_flush(SyncFailure::conflict(base_version, server_version))
                });
                slot.cancel_retry();
                warn!(
                    document_id = %slot.id,
                    base_version,
                    server_version,
                    "Version conflict, batch requeued"
                );
                FlushOutcome::Conflict {
                    server_version,
                    server_operations,
                }
            }
            Ok(Err(err)) => self.fail_retryable(slot, SyncFailure::network(err.to_string())),
            Err(_) => self.fail_retryable(
                slot,
                SyncFailure::timeout(format!("flush exceeded {}ms", timeout.as_millis())),
            ),
        };

        self.persist(slot).await;
        outcome
    }

    /// Requeue the in-flight batch and schedule the next attempt.
    fn fail_retryable(&self, slot: &Arc<DocumentSlot>, failure: SyncFailure) -> FlushOutcome {
        let attempt = slot.update(|entry| {
            entry.fail_flush(failure.clone());
            entry.state().retry_count
        });

        let retry_in = self.retry_policy().delay_for(attempt);
        match retry_in {
            Some(delay) => {
                warn!(
                    document_id = %slot.id,
                    error = %failure,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Flush failed, batch requeued"
                );
                self.schedule_retry(slot, attempt, delay);
            }
            None => {
                error!(
                    document_id = %slot.id,
                    error = %failure,
                    attempts = attempt,
                    "Flush failed, retries exhausted"
                );
            }
        }

        FlushOutcome::Failed { failure, retry_in }
    }

    fn schedule_retry(&self, slot: &Arc<DocumentSlot>, attempt: u32, delay: Duration) {
        let ticket = FlushTicket::new(slot);
        let engine = self.clone();
        let task_slot = slot.clone();
        let handle = tokio::spawn(async move {
            let _ticket = ticket;
            tokio::time::sleep(delay).await;
            // From here on this task must not be aborted by its own successor.
            task_slot.take_retry();
            let outcome = engine
                .run_flush(&task_slot, FlushReason::Retry { attempt })
                .await;
            debug!(document_id = %task_slot.id, attempt, ?outcome, "Retry finished");
        });
        slot.set_retry(handle);
    }

    async fn persist(&self, slot: &Arc<DocumentSlot>) {
        let _persist = slot.persist_lock.lock().await;
        if slot.is_closed() {
            return;
        }
        let (snapshot, state) = slot.read(|entry| (entry.snapshot(), entry.state().clone()));
        if let Err(err) = self
            .inner
            .persistence
            .persist(&slot.id, &snapshot, &state)
            .await
        {
            warn!(document_id = %slot.id, error = %err, "Failed to persist queue");
        }
    }

    // ------------------------------------------------------------------
    // Periodic trigger and lifecycle
    // ------------------------------------------------------------------

    /// One periodic pass: request a flush for every document with queued
    /// operations that is not waiting on conflict resolution. Returns how many
    /// flushes were requested.
    pub fn tick(&self) -> usize {
        let mut requested = 0;
        for slot in self.slots() {
            let (pending, status) = slot.read(|entry| (entry.queue_len(), entry.state().status));
            if status == SyncStatus::Conflict {
                continue;
            }
            if let Some(reason) = self.inner.policy.on_tick(pending) {
                if self.schedule_flush(&slot, reason) {
                    requested += 1;
                }
            }
        }
        if requested > 0 {
            debug!(requested, "Periodic flush pass");
        }
        requested
    }

    /// Start the periodic ticker. Calling it again restarts the ticker.
    pub fn start(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.policy.interval;
        let mut shutdown = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        SyncEngine { inner }.tick();
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Periodic ticker stopped");
        });

        if let Some(previous) = lock(&self.inner.ticker).replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Sync engine started");
    }

    /// Stop the ticker and all retry timers, and write every queue to
    /// persistence. Queued operations stay queued.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(ticker) = lock(&self.inner.ticker).take() {
            ticker.abort();
        }

        for slot in self.slots() {
            slot.cancel_retry();
            let _flush = slot.flush_lock.lock().await;
            self.persist(&slot).await;
        }
        info!("Sync engine shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
