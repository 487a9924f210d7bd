//! Unified error handling for the sync coordinator.

use crate::config::ConfigError;
use crate::persistence::PersistenceError;

/// Application error type.
///
/// Flush failures are not errors here: they are reported as
/// [`crate::FlushOutcome`] values and recorded in the document's sync state.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] canopy_engine::Error),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether the error is a caller bug rather than an environment problem.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, SyncError::Engine(_))
    }
}

/// Result type alias for coordinator calls.
pub type Result<T> = std::result::Result<T, SyncError>;
