//! Error taxonomy for batched fetches.
//!
//! A single [`BatchError`] is produced per batch window and handed to every
//! requester registered in that window, so the type is cheaply cloneable.

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Error type returned by external fetch functions.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result alias used throughout batchql.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors surfaced by loaders, deferred results and the coordinator.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BatchError {
    /// The external fetch for a window failed.
    #[error("batch fetch `{step}` failed: {source}")]
    Fetch {
        /// Rendered step name of the failing fetch.
        step: String,
        /// The underlying fetch error, shared by every requester in the window.
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    /// The window was cancelled before its fetch completed.
    #[error("batch fetch `{step}` was cancelled")]
    Cancelled {
        /// Rendered step name, or `"<unnamed>"` when cancelled before flush.
        step: String,
    },

    /// A required argument was missing or invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A memoized loader was requested with different key/value types.
    #[error("loader `{identity}` was registered as {expected}, requested as {requested}")]
    TypeMismatch {
        /// The identity the entry was looked up under.
        identity: String,
        /// What the entry was registered as.
        expected: &'static str,
        /// Type name of what the caller asked for.
        requested: &'static str,
    },
}

impl BatchError {
    /// Wraps an external fetch error with the step name that produced it.
    pub fn fetch(step: impl Into<String>, source: BoxError) -> Self {
        Self::Fetch {
            step: step.into(),
            source: Arc::from(source),
        }
    }

    /// Creates a cancellation outcome for a step.
    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::Cancelled { step: step.into() }
    }

    /// Creates an argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns true if this is a cancellation outcome.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the step name carried by fetch and cancellation errors.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Fetch { step, .. } | Self::Cancelled { step } => Some(step),
            _ => None,
        }
    }
}
