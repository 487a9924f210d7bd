//! Per-document runtime state held by the coordinator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use canopy_engine::{DocumentId, SyncEntry, SyncState};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Everything the coordinator keeps for one registered document.
///
/// The entry sits behind a std mutex that is never held across an await.
/// Flushes of this document are serialized by `flush_lock`; other documents
/// have their own slot and never contend with it.
#[derive(Debug)]
pub(crate) struct DocumentSlot {
    pub(crate) id: DocumentId,
    entry: Mutex<SyncEntry>,
    /// Held for the whole drain -> send -> confirm cycle.
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
    /// Orders snapshot writes so an older one never lands last.
    pub(crate) persist_lock: tokio::sync::Mutex<()>,
    /// A background flush is scheduled but has not taken `flush_lock` yet.
    flush_requested: AtomicBool,
    /// Set once the document is unregistered.
    closed: AtomicBool,
    /// Flushes and retries scheduled or running.
    scheduled: AtomicUsize,
    idle: Notify,
    retry: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<SyncState>,
}

impl DocumentSlot {
    pub(crate) fn new(entry: SyncEntry) -> Arc<Self> {
        let (status, _) = watch::channel(entry.state().clone());
        Arc::new(Self {
            id: entry.document().id.clone(),
            entry: Mutex::new(entry),
            flush_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            flush_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            scheduled: AtomicUsize::new(0),
            idle: Notify::new(),
            retry: Mutex::new(None),
            status,
        })
    }

    /// Read the entry.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&SyncEntry) -> R) -> R {
        f(&lock(&self.entry))
    }

    /// Mutate the entry and notify subscribers if the state changed.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut SyncEntry) -> R) -> R {
        let mut entry = lock(&self.entry);
        let result = f(&mut entry);
        let state = entry.state();
        self.status.send_if_modified(|current| {
            if current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
        result
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.status.subscribe()
    }

    /// Mark a background flush as requested. Returns false if one already is.
    pub(crate) fn request_flush(&self) -> bool {
        !self.flush_requested.swap(true, Ordering::SeqCst)
    }

    /// The requested flush has started; later requests schedule a new one.
    pub(crate) fn clear_request(&self) {
        self.flush_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Install a retry timer, aborting the previous one.
    pub(crate) fn set_retry(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.retry).replace(handle) {
            previous.abort();
        }
    }

    /// Forget the current retry timer without aborting it.
    /// Called by the timer itself once it fires.
    pub(crate) fn take_retry(&self) -> Option<JoinHandle<()>> {
        lock(&self.retry).take()
    }

    /// Abort the pending retry timer, if any.
    pub(crate) fn cancel_retry(&self) -> bool {
        match self.take_retry() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Wait until no flush or retry is scheduled or running.
    pub(crate) async fn settle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.scheduled.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts a scheduled flush for [`DocumentSlot::settle`]; dropping it (also by
/// aborting the task that owns it) releases the count.
pub(crate) struct FlushTicket {
    slot: Arc<DocumentSlot>,
}

impl FlushTicket {
    pub(crate) fn new(slot: &Arc<DocumentSlot>) -> Self {
        slot.scheduled.fetch_add(1, Ordering::SeqCst);
        Self { slot: slot.clone() }
    }
}

impl Drop for FlushTicket {
    fn drop(&mut self) {
        if self.slot.scheduled.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.slot.idle.notify_waiters();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
