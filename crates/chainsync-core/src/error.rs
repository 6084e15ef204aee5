//! Error types for the chainsync pipeline.

use thiserror::Error;

/// Errors that can occur while ingesting, recovering or initializing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The batch does not chain from the current network head.
    #[error("Fork detected at block {height}: expected parent {expected}, got {actual}")]
    ForkDetected {
        height: u64,
        expected: String,
        actual: String,
    },

    /// The event store rejected or failed a read/write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A read model failed while consuming a block or replaying an event.
    #[error("Model error in '{model}': {reason}")]
    Model { model: String, reason: String },

    /// The blockchain data source failed.
    #[error("Data source error: {0}")]
    Source(String),

    /// The fetch pipeline rejected a command.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Startup was cancelled by the operator.
    #[error("Initialization cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Returns `true` if the error is a fork signal (recoverable).
    pub fn is_fork(&self) -> bool {
        matches!(self, Self::ForkDetected { .. })
    }

    /// Returns `true` if repeating the same action may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ForkDetected { .. } | Self::Cancelled { .. } | Self::Config(_)
        )
    }

    /// A [`SyncError::Model`] for `model`.
    pub fn model(model: impl Into<String>, reason: impl ToString) -> Self {
        Self::Model {
            model: model.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}
