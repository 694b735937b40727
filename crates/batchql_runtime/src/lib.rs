//! Batching runtime for batchql.
//!
//! This crate provides deferred, coalescing data loading:
//! - `deferred`: Lazily resolved, memoized values
//! - `loader`: Keyed batch loaders with per-window coalescing
//! - `combinator`: Map, branch and fan-in loader combinators
//! - `join`: Parent-to-children query-joins
//! - `cache`: Structural pipeline cache shared across executions
//! - `coordinator`: Request-scoped loader registry
//! - `strategy`: Execution strategy per operation kind
//! - `executor`: Result-tree walker driving resolvers

pub mod cache;
pub mod combinator;
pub mod config;
pub mod coordinator;
pub mod deferred;
pub mod executor;
pub mod join;
pub mod loader;
pub mod query;
pub mod resolver;
pub mod strategy;

pub use cache::{PipelineCache, QueryJoinKey};
pub use combinator::{branch, combine_all, Branch, CombineAll, DynLoader, LoadExt, Mapped, MappedWithKey};
pub use config::BatchConfig;
pub use coordinator::BatchCoordinator;
pub use deferred::Deferred;
pub use executor::{Context, Executor, ExecutorConfig, FieldError, PathSegment, Response};
pub use join::{
    Grouping, JoinDeclaration, JoinHooks, JoinQuery, OrderBy, QueryJoinLoader, SortDirection, SortKey,
};
pub use loader::{FetchFn, KeyedBatchLoader, Load, LoaderBuilder, ResultMap};
pub use query::{FieldInfo, FieldNode, QueryPlan};
pub use resolver::{
    FieldValue, Resolver, ResolverArgs, ResolverError, ResolverInfo, ResolverMap, ResolverResult,
};
pub use strategy::{ExecutionStrategy, OperationKind, StrategyConfig, UnknownOperationKind};

pub use batchql_core::{property_path, value_join_key};
pub use batchql_core::{
    BatchError, BatchResult, BoxError, ContextKey, FnKey, JoinKey, JoinKeyKind, PathExpr, PropertyPath,
    StepName,
};
