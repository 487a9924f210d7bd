//! Error types for the Canopy engine.

use crate::{DocumentId, OperationId, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from the Canopy engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Registration errors
    #[error("document not registered: {0}")]
    UnregisteredDocument(DocumentId),

    // Validation errors
    #[error("invalid operation {op_id}: {reason}")]
    InvalidOperation { op_id: OperationId, reason: String },

    #[error("operation {op_id} out of order: version {version} is not after {last}")]
    OutOfOrderOperation {
        op_id: OperationId,
        version: Version,
        last: Version,
    },

    #[error("position {position} out of bounds for content of length {len}")]
    PositionOutOfBounds { position: usize, len: usize },

    // Sync errors
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: Version, actual: Version },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a flush did not reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Transient transport failure
    Network,
    /// The flush exceeded its time budget
    Timeout,
    /// The backend holds a different version than the one sent
    VersionConflict,
}

impl FailureKind {
    /// Whether the coordinator may retry on its own.
    ///
    /// Version conflicts need a resolver above the core, everything else is
    /// retried with backoff.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::VersionConflict)
    }
}

/// A recorded flush failure, as exposed through [`crate::SyncState::last_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn conflict(local: Version, server: Version) -> Self {
        Self::new(
            FailureKind::VersionConflict,
            format!("local version {local} does not match server version {server}"),
        )
    }
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
