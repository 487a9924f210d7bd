//! Sync entry - one document's queue, state and content under a single owner.
//!
//! All mutations of a document's sync bookkeeping go through [`SyncEntry`], which
//! keeps `SyncState::pending_operations` equal to the queue length after every
//! call and keeps a drained batch recoverable until the backend confirms it.

use crate::{
    error::Result, Document, EditorOperation, Error, OperationQueue, QueueSnapshot, RetryPolicy,
    SyncFailure, SyncState, SyncStatus, Timestamp, Version,
};

/// Outcome of [`SyncEntry::begin_flush`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlushStart {
    /// Nothing to send; the entry is now synced
    Empty,
    /// A batch to hand to the backend, built on `base_version`
    Batch {
        operations: Vec<EditorOperation>,
        base_version: Version,
    },
}

/// The sync bookkeeping for one document.
#[derive(Debug, Clone)]
pub struct SyncEntry {
    document: Document,
    queue: OperationQueue,
    state: SyncState,
    /// Drained but not yet confirmed
    in_flight: Vec<EditorOperation>,
}

impl SyncEntry {
    /// Start tracking a document with an empty queue.
    pub fn new(document: Document) -> Self {
        let mut entry = Self {
            document,
            queue: OperationQueue::new(),
            state: SyncState::new(),
            in_flight: Vec::new(),
        };
        entry.sync_metadata();
        entry
    }

    /// Start tracking a document, restoring a persisted queue and state.
    ///
    /// `document` is the acknowledged content; the restored operations are
    /// applied on top of it again, so the local snapshot matches the queue.
    /// A state persisted mid-flush comes back as pending: the in-flight batch
    /// is part of the snapshot and will be sent again.
    pub fn restore(
        mut document: Document,
        snapshot: Option<QueueSnapshot>,
        state: Option<SyncState>,
    ) -> Result<Self> {
        let queue = match snapshot {
            Some(snapshot) => {
                document.version = document.version.max(snapshot.base_version);
                snapshot.into_queue(&document.id)?
            }
            None => OperationQueue::new(),
        };
        for op in queue.iter() {
            document.apply(op).map_err(|err| {
                Error::InvalidSnapshot(format!("operation {} does not apply: {err}", op.id))
            })?;
        }

        let mut state = state.unwrap_or_default();
        state.pending_operations = queue.len();
        if state.status == SyncStatus::Syncing
            || (state.status == SyncStatus::Synced && !queue.is_empty())
        {
            state.status = SyncStatus::Pending;
        }

        let mut entry = Self {
            document,
            queue,
            state,
            in_flight: Vec::new(),
        };
        entry.sync_metadata();
        Ok(entry)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a drained batch is waiting for confirmation.
    pub fn is_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Validate, apply locally and queue an operation.
    ///
    /// Returns the new queue length. Rejected operations leave the entry
    /// untouched.
    pub fn enqueue(&mut self, op: EditorOperation) -> Result<usize> {
        op.validate()?;
        self.queue.check_order(&op)?;
        self.document.validate(&op)?;

        self.document.apply(&op)?;
        self.state.mark_enqueued(&op, self.queue.len() + 1);
        self.queue.push(op)?;
        self.sync_metadata();
        Ok(self.queue.len())
    }

    /// Remove up to `max` operations from the head without flushing them.
    pub fn drain(&mut self, max: usize) -> Vec<EditorOperation> {
        let drained = self.queue.drain(max);
        self.state.mark_drained(&drained, self.queue.len());
        drained
    }

    /// Highest version queued on this document, including restored operations.
    /// New local operations must be stamped above it.
    pub fn last_version(&self) -> Version {
        self.queue.high_water()
    }

    /// Renew the retry budget once it has run out. See [`SyncState::renew_retries`].
    pub fn renew_retries(&mut self, policy: &RetryPolicy) -> bool {
        self.state.renew_retries(policy)
    }

    /// Drain the next batch for the backend and move to syncing.
    pub fn begin_flush(&mut self, max: usize, now: Timestamp) -> FlushStart {
        debug_assert!(self.in_flight.is_empty(), "flush already in flight");

        let batch = self.queue.drain(max);
        if batch.is_empty() {
            self.state
                .mark_synced(&[], self.document.version, 0, now);
            self.sync_metadata();
            return FlushStart::Empty;
        }

        self.in_flight = batch.clone();
        self.state.mark_syncing(self.queue.len());
        self.sync_metadata();
        FlushStart::Batch {
            operations: batch,
            base_version: self.document.version,
        }
    }

    /// The backend accepted the in-flight batch at `new_version`.
    ///
    /// Returns how many operations were confirmed. A version that would move
    /// the document backwards is a conflict: the backend did take the batch,
    /// so it is not requeued, and the document waits for resolution.
    pub fn complete_flush(&mut self, new_version: Version, now: Timestamp) -> Result<usize> {
        let local_version = self.document.version;
        let advanced = self.document.advance_to(new_version);
        let batch = std::mem::take(&mut self.in_flight);

        if let Err(err) = advanced {
            self.state.mark_drained(&batch, self.queue.len());
            self.state
                .mark_failed(SyncFailure::conflict(local_version, new_version), self.queue.len());
            self.sync_metadata();
            return Err(err);
        }

        self.state
            .mark_synced(&batch, new_version, self.queue.len(), now);
        self.sync_metadata();
        Ok(batch.len())
    }

    /// The in-flight batch failed; put it back at the head.
    pub fn fail_flush(&mut self, failure: SyncFailure) {
        let batch = std::mem::take(&mut self.in_flight);
        self.queue.requeue_front(batch);
        self.state.mark_failed(failure, self.queue.len());
        self.sync_metadata();
    }

    /// A flush was requested while offline.
    pub fn mark_offline(&mut self) {
        self.state.mark_offline(self.queue.len());
        self.sync_metadata();
    }

    /// Adopt the backend's version after a conflict was resolved elsewhere.
    pub fn resolve_conflict(&mut self, server_version: Version) {
        self.document.version = server_version;
        self.state.mark_resolved(self.queue.len());
        self.sync_metadata();
    }

    /// Record presence information reported for a device.
    pub fn update_device(&mut self, device_id: &str, update: crate::DeviceSyncState) {
        self.state.update_device(device_id, update);
    }

    /// Persistable image: the in-flight batch followed by the queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut snapshot =
            QueueSnapshot::capture(self.document.id.clone(), self.document.version, &self.queue);
        if !self.in_flight.is_empty() {
            let mut operations = self.in_flight.clone();
            operations.append(&mut snapshot.operations);
            snapshot.operations = operations;
        }
        snapshot
    }

    fn sync_metadata(&mut self) {
        self.document.metadata.sync_status = self.state.status;
    }
}
