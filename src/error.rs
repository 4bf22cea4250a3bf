//! Error types for linkgraph.
//!
//! All errors are strongly typed using thiserror. Each stage owns its own
//! error enum (`StorageError`, `ScoringError`, `StallError`); `LinkingError`
//! wraps them for callers that drive the whole pipeline.

use thiserror::Error;

use crate::ids::{EntityKeyId, EntitySetId};
use crate::progress::StallError;
use crate::scoring::ScoringError;
use crate::storage::StorageError;

/// Validation errors for inputs and configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Threshold {value} must be finite and greater than 0")]
    InvalidThreshold {
        value: f64,
    },

    #[error("Score bias {value} must be finite and non-negative")]
    InvalidBias {
        value: f64,
    },

    #[error("Poll interval must be greater than 0")]
    ZeroPollInterval,

    #[error("Max stalls must be at least 1")]
    ZeroMaxStalls,

    #[error("Block for graph {graph_id} contains an entity from another graph ({other})")]
    MixedBlock {
        graph_id: String,
        other: String,
    },
}

/// Top-level error type for linkgraph.
#[derive(Debug, Error)]
pub enum LinkingError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Scoring error: {0}")]
    Scoring(#[from] ScoringError),

    #[error("Stalled: {0}")]
    Stall(#[from] StallError),

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityKeyId),

    #[error("No sync id registered for entity set {0}")]
    MissingSyncId(EntitySetId),

    #[error("Queue full on {path} path (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Worker pool disconnected on {path} path")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl LinkingError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a scoring error.
    #[must_use]
    pub const fn is_scoring(&self) -> bool {
        matches!(self, Self::Scoring(_))
    }

    /// Returns true if the completion wait gave up.
    #[must_use]
    pub const fn is_stall(&self) -> bool {
        matches!(self, Self::Stall(_))
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// A stall is retryable: it only means no progress was observed, not
    /// that the graph is inconsistent.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Internal { .. } => false,
            Self::Storage(e) => matches!(e, StorageError::BackendError(_)),
            Self::Scoring(e) => matches!(e, ScoringError::Unavailable(_)),
            Self::Stall(_) | Self::QueueFull { .. } | Self::Timeout { .. } => true,
            Self::EntityNotFound(_) | Self::MissingSyncId(_) | Self::Disconnected { .. } => false,
        }
    }
}

/// Result type alias for linkgraph operations.
pub type LinkingResult<T> = Result<T, LinkingError>;
