//! Keyed batch loaders for N+1 prevention.
//!
//! A [`KeyedBatchLoader`] collects the keys requested during one batch
//! window and resolves all of them with a single call to an external fetch
//! function. The window is flushed by the first `get` on any deferred result
//! registered in it; keys loaded after that point open a new window.
//!
//! Loaded keys stay cached for the loader's lifetime, so requesting a key
//! again resolves from the earlier window instead of fetching it twice.

use crate::deferred::{Deferred, Resolve};
use batchql_core::{
    BatchError, BatchResult, BoxError, Instrumentation, StepName, TracingInstrumentation,
};
use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};

/// Key→value mapping returned by a fetch. Missing keys are not errors.
pub type ResultMap<K, V> = HashMap<K, V>;

type SyncFetch<K, V> = dyn Fn(&[K]) -> Result<ResultMap<K, V>, BoxError> + Send + Sync;
type AsyncFetch<K, V> = dyn Fn(Vec<K>, CancellationToken) -> BoxFuture<'static, Result<ResultMap<K, V>, BoxError>>
    + Send
    + Sync;
type StreamFetch<K, V> =
    dyn Fn(Vec<K>, CancellationToken) -> BoxStream<'static, Result<(K, V), BoxError>> + Send + Sync;
type DefaultFactory<K, V> = dyn Fn(&K) -> V + Send + Sync;

/// The external fetch function, in one of its three shapes.
pub enum FetchFn<K, V> {
    /// Returns the result map directly.
    Sync(Arc<SyncFetch<K, V>>),
    /// Returns a future of the result map.
    Async(Arc<AsyncFetch<K, V>>),
    /// Streams key/value pairs; used for large or incremental result sets.
    Stream(Arc<StreamFetch<K, V>>),
}

impl<K, V> Clone for FetchFn<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
            Self::Stream(f) => Self::Stream(Arc::clone(f)),
        }
    }
}

impl<K, V> fmt::Debug for FetchFn<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync(_) => "FetchFn::Sync",
            Self::Async(_) => "FetchFn::Async",
            Self::Stream(_) => "FetchFn::Stream",
        })
    }
}

impl<K, V> FetchFn<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// A synchronous fetch.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&[K]) -> Result<ResultMap<K, V>, BoxError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// A future-returning fetch.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<K>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResultMap<K, V>, BoxError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |keys, cancel| f(keys, cancel).boxed()))
    }

    /// A streaming fetch.
    pub fn stream<F, S>(f: F) -> Self
    where
        F: Fn(Vec<K>, CancellationToken) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<(K, V), BoxError>> + Send + 'static,
    {
        Self::Stream(Arc::new(move |keys, cancel| f(keys, cancel).boxed()))
    }

    fn call(
        &self,
        keys: Vec<K>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ResultMap<K, V>, BoxError>> {
        match self {
            Self::Sync(f) => {
                let f = Arc::clone(f);
                async move { f(&keys) }.boxed()
            }
            Self::Async(f) => f(keys, cancel),
            Self::Stream(f) => f(keys, cancel)
                .try_fold(HashMap::new(), |mut map, (key, value)| async move {
                    map.insert(key, value);
                    Ok(map)
                })
                .boxed(),
        }
    }
}

type WindowOutcome<K, V> = BatchResult<Arc<ResultMap<K, V>>>;
type Flush<K, V> = Shared<BoxFuture<'static, WindowOutcome<K, V>>>;

/// Immutable per-loader configuration shared with in-flight flushes.
struct FetchPlan<K, V> {
    step: StepName,
    fetch: FetchFn<K, V>,
    default: Arc<DefaultFactory<K, V>>,
    max_batch_size: Option<usize>,
    instrumentation: Arc<dyn Instrumentation>,
}

impl<K, V> FetchPlan<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Fetches every key of one window. Cancellation or any fetch fault
    /// fails the whole window.
    async fn run(self: Arc<Self>, keys: Vec<K>, cancel: CancellationToken) -> WindowOutcome<K, V> {
        let span = self.instrumentation.flush(&self.step, keys.len());
        let work = async {
            debug!(keys = keys.len(), "flushing batch window");
            let map = match self.max_batch_size {
                Some(max) if keys.len() > max => {
                    let chunks = keys
                        .chunks(max)
                        .map(|chunk| self.fetch_chunk(chunk.to_vec(), &cancel));
                    let mut merged = HashMap::with_capacity(keys.len());
                    for part in try_join_all(chunks).await? {
                        merged.extend(part);
                    }
                    merged
                }
                _ => self.fetch_chunk(keys, &cancel).await?,
            };
            trace!(values = map.len(), "batch window resolved");
            Ok(Arc::new(map))
        };

        async {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("batch window cancelled");
                    Err(BatchError::cancelled(self.step.render()))
                }
                outcome = work => outcome,
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_chunk(
        &self,
        keys: Vec<K>,
        cancel: &CancellationToken,
    ) -> BatchResult<ResultMap<K, V>> {
        let span = self.instrumentation.fetch(&self.step, keys.len());
        self.fetch
            .call(keys, cancel.clone())
            .instrument(span)
            .await
            .map_err(|source| BatchError::fetch(self.step.render(), source))
    }
}

enum WindowState<K, V> {
    Collecting(Vec<K>),
    Flushing(Flush<K, V>),
}

/// The keys collected between two flush points.
struct BatchWindow<K, V> {
    state: Mutex<WindowState<K, V>>,
}

impl<K, V> BatchWindow<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState::Collecting(Vec::new())),
        }
    }

    /// Adds a key, returning false once the window has been sealed.
    fn register(&self, key: K) -> bool {
        match &mut *self.state.lock() {
            WindowState::Collecting(keys) => {
                keys.push(key);
                true
            }
            WindowState::Flushing(_) => false,
        }
    }

    fn pending_len(&self) -> usize {
        match &*self.state.lock() {
            WindowState::Collecting(keys) => keys.len(),
            WindowState::Flushing(_) => 0,
        }
    }

    fn was_cancelled(&self) -> bool {
        match &*self.state.lock() {
            WindowState::Flushing(flush) => {
                matches!(flush.peek(), Some(Err(err)) if err.is_cancelled())
            }
            WindowState::Collecting(_) => false,
        }
    }

    /// Seals the window on first call and returns the shared flush.
    fn flush(&self, plan: &Arc<FetchPlan<K, V>>, cancel: &CancellationToken) -> Flush<K, V> {
        let mut state = self.state.lock();
        match &mut *state {
            WindowState::Flushing(flush) => flush.clone(),
            WindowState::Collecting(keys) => {
                let keys: IndexSet<K> = std::mem::take(keys).into_iter().collect();
                let keys = keys.into_iter().collect();
                let flush = Arc::clone(plan).run(keys, cancel.clone()).boxed().shared();
                *state = WindowState::Flushing(flush.clone());
                flush
            }
        }
    }
}

/// One requester's key plus the window it waits on.
struct PendingRequest<K, V> {
    key: K,
    window: Arc<BatchWindow<K, V>>,
    plan: Arc<FetchPlan<K, V>>,
}

impl<K, V> Resolve<V> for PendingRequest<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn resolve<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, BatchResult<V>> {
        let flush = self.window.flush(&self.plan, cancel);
        Box::pin(async move {
            let map = flush.await?;
            Ok(map
                .get(&self.key)
                .cloned()
                .unwrap_or_else(|| (self.plan.default)(&self.key)))
        })
    }

    fn describe(&self) -> String {
        self.plan.step.render()
    }
}

enum Slot<K, V> {
    Pending(Arc<BatchWindow<K, V>>),
    Primed(V),
}

struct LoaderState<K, V> {
    current: Arc<BatchWindow<K, V>>,
    cache: FxHashMap<K, Slot<K, V>>,
}

/// Anything that turns a key into a deferred value.
pub trait Load<K>: Send + Sync {
    /// The resolved value type.
    type Value: Clone + Send + Sync + 'static;

    /// Registers `key` and returns its deferred value.
    fn load(&self, key: K) -> Deferred<Self::Value>;
}

impl<K, L> Load<K> for Arc<L>
where
    L: Load<K> + ?Sized,
{
    type Value = L::Value;

    fn load(&self, key: K) -> Deferred<Self::Value> {
        (**self).load(key)
    }
}

/// A loader that coalesces keys into one fetch per batch window.
pub struct KeyedBatchLoader<K, V> {
    plan: Arc<FetchPlan<K, V>>,
    state: Mutex<LoaderState<K, V>>,
}

impl<K, V> fmt::Debug for KeyedBatchLoader<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedBatchLoader")
            .field("fetch", &self.plan.fetch)
            .field("max_batch_size", &self.plan.max_batch_size)
            .finish_non_exhaustive()
    }
}

impl<K, V> KeyedBatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a loader that resolves missing keys to `V::default()`.
    pub fn new(step: impl Into<StepName>, fetch: FetchFn<K, V>) -> Self
    where
        V: Default,
    {
        Self::from_plan(FetchPlan {
            step: step.into(),
            fetch,
            default: Arc::new(|_: &K| V::default()),
            max_batch_size: None,
            instrumentation: Arc::new(TracingInstrumentation),
        })
    }

    /// Starts a loader builder.
    pub fn builder(step: impl Into<StepName>, fetch: FetchFn<K, V>) -> LoaderBuilder<K, V> {
        LoaderBuilder {
            step: step.into(),
            fetch,
            default: None,
            max_batch_size: None,
            instrumentation: None,
        }
    }

    fn from_plan(plan: FetchPlan<K, V>) -> Self {
        Self {
            plan: Arc::new(plan),
            state: Mutex::new(LoaderState {
                current: Arc::new(BatchWindow::new()),
                cache: FxHashMap::default(),
            }),
        }
    }

    /// Registers a key in the current window.
    ///
    /// Keys seen before resolve from their original window (or primed
    /// value) without joining the current one.
    pub fn load(&self, key: K) -> Deferred<V> {
        let mut state = self.state.lock();

        let cached = match state.cache.get(&key) {
            Some(Slot::Primed(value)) => return Deferred::ready(value.clone()),
            Some(Slot::Pending(window)) if !window.was_cancelled() => Some(Arc::clone(window)),
            _ => None,
        };

        let window = match cached {
            Some(window) => window,
            None => {
                let window = loop {
                    let window = Arc::clone(&state.current);
                    if window.register(key.clone()) {
                        break window;
                    }
                    state.current = Arc::new(BatchWindow::new());
                };
                trace!(step = %self.plan.step.render(), "registered key");
                state.cache.insert(key.clone(), Slot::Pending(Arc::clone(&window)));
                window
            }
        };

        Deferred::from_node(Arc::new(PendingRequest {
            key,
            window,
            plan: Arc::clone(&self.plan),
        }))
    }

    /// Loads several keys; the result preserves request order.
    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Deferred<Vec<V>> {
        Deferred::join_all(keys.into_iter().map(|key| self.load(key)).collect())
    }

    /// Seeds the cache with a value. Existing entries are kept.
    pub fn prime(&self, key: K, value: V) {
        self.state
            .lock()
            .cache
            .entry(key)
            .or_insert(Slot::Primed(value));
    }

    /// Forgets a cached key; the next load fetches it again.
    pub fn clear_key(&self, key: &K) {
        self.state.lock().cache.remove(key);
    }

    /// Forgets every cached key. Deferreds already handed out still resolve.
    pub fn clear(&self) {
        self.state.lock().cache.clear();
    }

    /// Number of keys waiting in the current, unflushed window.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().current.pending_len()
    }
}

impl<K, V> Load<K> for KeyedBatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Value = V;

    fn load(&self, key: K) -> Deferred<V> {
        KeyedBatchLoader::load(self, key)
    }
}

/// Builder for [`KeyedBatchLoader`].
pub struct LoaderBuilder<K, V> {
    step: StepName,
    fetch: FetchFn<K, V>,
    default: Option<Arc<DefaultFactory<K, V>>>,
    max_batch_size: Option<usize>,
    instrumentation: Option<Arc<dyn Instrumentation>>,
}

impl<K, V> LoaderBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Sets the value used for keys missing from the fetch result.
    #[must_use]
    pub fn default_value(self, value: V) -> Self {
        self.default_with(move |_| value.clone())
    }

    /// Sets a factory computing the value for a missing key.
    #[must_use]
    pub fn default_with<F>(mut self, factory: F) -> Self
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        self.default = Some(Arc::new(factory));
        self
    }

    /// Splits flushes into fetches of at most `size` keys.
    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Sets the instrumentation used for flush and fetch scopes.
    #[must_use]
    pub fn instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Builds the loader.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidArgument`] when no default was given or
    /// the batch size is zero.
    pub fn build(self) -> BatchResult<KeyedBatchLoader<K, V>> {
        let default = self.default.ok_or_else(|| {
            BatchError::invalid_argument(format!(
                "loader `{}` needs a default value for missing keys",
                self.step.render()
            ))
        })?;
        if self.max_batch_size == Some(0) {
            return Err(BatchError::invalid_argument("max_batch_size must be at least 1"));
        }

        Ok(KeyedBatchLoader::from_plan(FetchPlan {
            step: self.step,
            fetch: self.fetch,
            default,
            max_batch_size: self.max_batch_size,
            instrumentation: self
                .instrumentation
                .unwrap_or_else(|| Arc::new(TracingInstrumentation)),
        }))
    }
}
