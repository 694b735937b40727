//! Instrumentation seam for batch flushes and fetches.
//!
//! Loaders open one scope per window flush and one per external fetch call.
//! A scope is a [`tracing::Span`]; loaders attach it to the flush/fetch
//! future with [`tracing::Instrument`], so the scope closes when the future
//! completes.

use crate::step::StepName;
use std::fmt::Debug;
use tracing::field::Empty;
use tracing::Span;

/// Opens scopes around batched work.
pub trait Instrumentation: Send + Sync + Debug + 'static {
    /// Scope for flushing one batch window.
    fn flush(&self, step: &StepName, keys: usize) -> Span;

    /// Scope for a single external fetch call within a flush.
    fn fetch(&self, step: &StepName, keys: usize) -> Span;
}

/// Default instrumentation backed by `tracing` spans.
///
/// The step name is only rendered when the span is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInstrumentation;

impl Instrumentation for TracingInstrumentation {
    fn flush(&self, step: &StepName, keys: usize) -> Span {
        let span = tracing::debug_span!("batch_flush", step = Empty, keys);
        if !span.is_disabled() {
            span.record("step", step.render().as_str());
        }
        span
    }

    fn fetch(&self, step: &StepName, keys: usize) -> Span {
        let span = tracing::trace_span!("batch_fetch", step = Empty, keys);
        if !span.is_disabled() {
            span.record("step", step.render().as_str());
        }
        span
    }
}

/// Instrumentation that opens no scopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {
    fn flush(&self, _step: &StepName, _keys: usize) -> Span {
        Span::none()
    }

    fn fetch(&self, _step: &StepName, _keys: usize) -> Span {
        Span::none()
    }
}
