//! Backend transport for flushing operation batches.
//!
//! The coordinator only knows the [`Transport`] trait. Networking, auth and the
//! wire protocol belong to the implementation; [`MemoryTransport`] is an
//! in-process backend used by tests and the demo binary.

mod memory;
mod protocol;

pub use memory::MemoryTransport;
pub use protocol::*;

use async_trait::async_trait;
use canopy_engine::{EditorOperation, Version};

/// Transport-level failures. All of them are retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend unavailable")]
    Unavailable,
}

/// Sends a document's batch to the backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Push `operations`, built on `version`, for `document_id`.
    async fn send(
        &self,
        document_id: &str,
        version: Version,
        operations: &[EditorOperation],
    ) -> Result<SendOutcome, TransportError>;
}
