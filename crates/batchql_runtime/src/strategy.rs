//! Execution strategy selection.
//!
//! Batch windows register keys without coordinating with each other, which
//! is only sound while field resolution for one operation happens one step
//! at a time. The walker consults a [`StrategyConfig`] per operation kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of operation being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        })
    }
}

impl FromStr for OperationKind {
    type Err = UnknownOperationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "mutation" => Ok(Self::Mutation),
            "subscription" => Ok(Self::Subscription),
            other => Err(UnknownOperationKind(other.to_string())),
        }
    }
}

/// Error returned when parsing an unknown operation keyword.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation kind `{0}`")]
pub struct UnknownOperationKind(pub String);

/// How the walker schedules sibling resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Resolvers run one at a time; all keys of a level are registered
    /// before any window flushes.
    Serial,
    /// Sibling subtrees are driven concurrently.
    Parallel,
}

impl ExecutionStrategy {
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial)
    }
}

/// Strategy per operation kind.
///
/// Queries and mutations always resolve serially; only the strategy for
/// other operation kinds is configurable. Unknown fields are rejected, so a
/// configuration asking for parallel queries fails to load instead of being
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrategyConfig {
    pub subscription: ExecutionStrategy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            subscription: ExecutionStrategy::Parallel,
        }
    }
}

impl StrategyConfig {
    /// The strategy installed for `kind`.
    #[must_use]
    pub const fn for_operation(&self, kind: OperationKind) -> ExecutionStrategy {
        match kind {
            OperationKind::Query | OperationKind::Mutation => ExecutionStrategy::Serial,
            OperationKind::Subscription => self.subscription,
        }
    }

    /// Overrides the strategy for subscriptions.
    #[must_use]
    pub const fn with_subscription(mut self, strategy: ExecutionStrategy) -> Self {
        self.subscription = strategy;
        self
    }
}
