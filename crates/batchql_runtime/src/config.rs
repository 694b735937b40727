//! Batching configuration.

use crate::strategy::StrategyConfig;
use batchql_core::{BatchError, BatchResult};
use serde::{Deserialize, Serialize};

/// Configuration shared by a coordinator and the loaders it builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Upper bound on keys per fetch. A larger window is split into chunks
    /// fetched concurrently; unset means one fetch per window.
    pub max_batch_size: Option<usize>,
    /// Upper bound on distinct join shapes kept in the pipeline cache.
    pub pipeline_cache_capacity: Option<usize>,
    /// Execution strategy per operation kind.
    pub strategies: StrategyConfig,
}

impl BatchConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_pipeline_cache_capacity(mut self, capacity: usize) -> Self {
        self.pipeline_cache_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_strategies(mut self, strategies: StrategyConfig) -> Self {
        self.strategies = strategies;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidArgument`] for a zero batch size or a
    /// zero cache capacity.
    pub fn validate(&self) -> BatchResult<()> {
        if self.max_batch_size == Some(0) {
            return Err(BatchError::invalid_argument("max_batch_size must be at least 1"));
        }
        if self.pipeline_cache_capacity == Some(0) {
            return Err(BatchError::invalid_argument(
                "pipeline_cache_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}
