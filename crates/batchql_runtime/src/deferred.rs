//! Deferred results.
//!
//! A [`Deferred`] is a handle to a value that becomes available once the
//! batch window it belongs to has been flushed. Handles are cheap to clone;
//! all clones share one memoized outcome, so `get` resolves the underlying
//! node at most once no matter how often or from where it is awaited.
//!
//! Composition (`map`, `and_then`, `join_all`) builds explicit resolution
//! nodes and never forces evaluation: nothing is fetched until some caller
//! awaits `get`.

use batchql_core::{BatchError, BatchResult};
use futures::future::{try_join_all, BoxFuture};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// A node that knows how to produce a deferred value.
pub(crate) trait Resolve<V>: Send + Sync {
    /// Produces the value, honouring `cancel`.
    fn resolve<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, BatchResult<V>>;

    /// Label used when a caller is cancelled while waiting on this node.
    fn describe(&self) -> String {
        "<deferred>".to_string()
    }
}

/// A handle to a not-yet-available value.
pub struct Deferred<V> {
    node: Arc<dyn Resolve<V>>,
    outcome: Arc<OnceCell<BatchResult<V>>>,
}

impl<V> Clone for Deferred<V> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            outcome: Arc::clone(&self.outcome),
        }
    }
}

impl<V> fmt::Debug for Deferred<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("resolved", &self.outcome.initialized())
            .finish_non_exhaustive()
    }
}

impl<V> Deferred<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(node: Arc<dyn Resolve<V>>) -> Self {
        Self {
            node,
            outcome: Arc::new(OnceCell::new()),
        }
    }

    /// A deferred that is already resolved to `value`.
    pub fn ready(value: V) -> Self {
        Self::settled(Ok(value))
    }

    /// A deferred that is already failed.
    pub fn failed(error: BatchError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(outcome: BatchResult<V>) -> Self {
        Self {
            node: Arc::new(Ready(outcome.clone())),
            outcome: Arc::new(OnceCell::new_with(Some(outcome))),
        }
    }

    /// Awaits the value.
    ///
    /// The first call drives the owning batch window's fetch; every later
    /// call (on this handle or any clone) returns the memoized outcome. If
    /// `cancel` fires first, this caller observes [`BatchError::Cancelled`]
    /// and nothing is memoized on its behalf.
    pub async fn get(&self, cancel: &CancellationToken) -> BatchResult<V> {
        if let Some(outcome) = self.outcome.get() {
            return outcome.clone();
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BatchError::cancelled(self.node.describe())),
            outcome = self.outcome.get_or_init(|| self.node.resolve(cancel)) => outcome.clone(),
        }
    }

    /// Returns the outcome if it is already known.
    #[must_use]
    pub fn peek(&self) -> Option<BatchResult<V>> {
        self.outcome.get().cloned()
    }

    /// Returns true once the outcome is memoized.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.outcome.initialized()
    }

    /// Transforms the value once it is available.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(V) -> U + Send + Sync + 'static,
    {
        Deferred::from_node(Arc::new(Map {
            inner: self,
            f: Box::new(f),
        }))
    }

    /// Chains a dependent deferred, e.g. a second batched load keyed by the
    /// first result.
    #[must_use]
    pub fn and_then<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(V) -> Deferred<U> + Send + Sync + 'static,
    {
        Deferred::from_node(Arc::new(AndThen {
            inner: self,
            f: Box::new(f),
        }))
    }

    /// Resolves every part, preserving input order.
    ///
    /// The parts are awaited concurrently; the first failure wins.
    #[must_use]
    pub fn join_all(parts: Vec<Deferred<V>>) -> Deferred<Vec<V>> {
        Deferred::from_node(Arc::new(JoinAll { parts }))
    }
}

struct Ready<V>(BatchResult<V>);

impl<V> Resolve<V> for Ready<V>
where
    V: Clone + Send + Sync,
{
    fn resolve<'a>(&'a self, _cancel: &'a CancellationToken) -> BoxFuture<'a, BatchResult<V>> {
        let outcome = self.0.clone();
        Box::pin(async move { outcome })
    }
}

struct Map<V, U> {
    inner: Deferred<V>,
    f: Box<dyn Fn(V) -> U + Send + Sync>,
}

impl<V, U> Resolve<U> for Map<V, U>
where
    V: Clone + Send + Sync + 'static,
    U: Send + Sync,
{
    fn resolve<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, BatchResult<U>> {
        Box::pin(async move { self.inner.get(cancel).await.map(&self.f) })
    }

    fn describe(&self) -> String {
        self.inner.node.describe()
    }
}

struct AndThen<V, U> {
    inner: Deferred<V>,
    f: Box<dyn Fn(V) -> Deferred<U> + Send + Sync>,
}

impl<V, U> Resolve<U> for AndThen<V, U>
where
    V: Clone + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    fn resolve<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, BatchResult<U>> {
        Box::pin(async move {
            let value = self.inner.get(cancel).await?;
            (self.f)(value).get(cancel).await
        })
    }

    fn describe(&self) -> String {
        self.inner.node.describe()
    }
}

struct JoinAll<V> {
    parts: Vec<Deferred<V>>,
}

impl<V> Resolve<Vec<V>> for JoinAll<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn resolve<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, BatchResult<Vec<V>>> {
        Box::pin(try_join_all(self.parts.iter().map(|part| part.get(cancel))))
    }
}
