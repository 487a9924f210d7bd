//! # Canopy Sync
//!
//! Async sync coordinator for Canopy survey documents.
//!
//! [`SyncEngine`] keeps one operation queue per registered document and
//! flushes it to a [`Transport`] when the queue reaches the batch size, on a
//! periodic timer, on explicit request and on retry after a failure. Queues
//! and state are written to a [`Persistence`] after every change so unsynced
//! edits survive a restart.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use canopy_engine::Document;
//! use canopy_sync::{MemoryPersistence, MemoryTransport, OperationFactory, SyncConfig, SyncEngine};
//!
//! # async fn run() -> canopy_sync::Result<()> {
//! let engine = SyncEngine::new(
//!     SyncConfig::default(),
//!     MemoryTransport::new_shared(),
//!     MemoryPersistence::new_shared(),
//! );
//! engine.start();
//!
//! engine.register_document(Document::new("plot-7", "Plot 7")).await?;
//! let mut factory = OperationFactory::new("tablet-1", "surveyor-1");
//! engine.queue_operation(factory.insert("plot-7", 0, "Quercus robur, DBH 54cm")).await?;
//!
//! engine.force_sync("plot-7").await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod persistence;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use coordinator::{EnqueueReceipt, FlushOutcome, Registration, SyncEngine};
pub use error::{Result, SyncError};
pub use factory::OperationFactory;
pub use persistence::{JsonFilePersistence, MemoryPersistence, Persistence, PersistenceError};
pub use transport::{MemoryTransport, PushBatch, SendOutcome, Transport, TransportError};
