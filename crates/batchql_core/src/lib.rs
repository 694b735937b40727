//! Core types for batchql.
//!
//! This crate provides the foundational types shared by the batching runtime:
//! - `error`: Batch error taxonomy
//! - `step`: Lazily rendered step names
//! - `instrument`: Flush/fetch instrumentation seam
//! - `path`: Property-path descriptors with structural equality
//! - `key`: Join-key classification, function keys and execution-context keys

pub mod error;
pub mod instrument;
pub mod key;
pub mod path;
pub mod step;

pub use error::{BatchError, BatchResult, BoxError};
pub use instrument::{Instrumentation, NoopInstrumentation, TracingInstrumentation};
pub use key::{ContextKey, FnKey, JoinKey, JoinKeyKind, ValueKey};
pub use path::{PathExpr, PropertyPath};
pub use step::StepName;
