//! # Canopy Engine
//!
//! Deterministic bookkeeping for syncing survey documents between devices.
//!
//! This crate holds the pure logic behind the sync coordinator: editor
//! operations, the per-document FIFO queue, the sync state machine, the flush
//! trigger policy and retry backoff. It never touches the network, the disk or
//! a clock; callers pass timestamps in.
//!
//! ## Design Principles
//!
//! - **No IO**: transport and persistence live in `canopy-sync`
//! - **No data loss**: a drained batch stays recoverable until confirmed
//! - **FIFO**: operations leave a queue in the order they entered it
//! - **Consistent state**: `pending_operations` always equals the queue length
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! A local edit is an [`EditorOperation`] of some [`OperationKind`]. Its
//! `version` must increase for every operation queued on a document.
//!
//! ### Entries
//!
//! A [`SyncEntry`] owns one [`Document`], its [`OperationQueue`] and its
//! [`SyncState`]. Flushes go through [`SyncEntry::begin_flush`] followed by
//! either [`SyncEntry::complete_flush`] or [`SyncEntry::fail_flush`].
//!
//! ## Quick Start
//!
//! ```rust
//! use canopy_engine::{
//!     Document, EditorOperation, FlushStart, OperationKind, SyncEntry, SyncStatus,
//! };
//!
//! let mut entry = SyncEntry::new(Document::new("doc-1", "Oak survey"));
//!
//! let op = EditorOperation::new("op-1", "doc-1", OperationKind::Insert, 0, "Quercus")
//!     .with_origin("tablet", "surveyor-1")
//!     .with_version(1)
//!     .with_timestamp(1706745600000);
//! entry.enqueue(op).unwrap();
//!
//! let FlushStart::Batch { operations, base_version } = entry.begin_flush(100, 1706745601000)
//! else {
//!     unreachable!()
//! };
//! assert_eq!(operations.len(), 1);
//! assert_eq!(base_version, 0);
//!
//! entry.complete_flush(1, 1706745602000).unwrap();
//! assert_eq!(entry.state().status, SyncStatus::Synced);
//! ```

pub mod clock;
pub mod document;
pub mod entry;
pub mod error;
pub mod operation;
pub mod queue;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod trigger;

// Re-export main types at crate root
pub use clock::OperationClock;
pub use document::{Document, DocumentMetadata, Permission};
pub use entry::{FlushStart, SyncEntry};
pub use error::{Error, FailureKind, SyncFailure};
pub use operation::{EditorOperation, OperationKind, SPAN_LENGTH_KEY};
pub use queue::OperationQueue;
pub use retry::RetryPolicy;
pub use snapshot::{QueueSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::{DeviceSyncState, NetworkQuality, SyncState, SyncStatus};
pub use trigger::{FlushPolicy, FlushReason, DEFAULT_BATCH_SIZE, DEFAULT_SYNC_INTERVAL};

/// Type aliases for clarity
pub type DocumentId = String;
pub type OperationId = String;
pub type DeviceId = String;
pub type UserId = String;
pub type Version = u64;
pub type Timestamp = u64;
