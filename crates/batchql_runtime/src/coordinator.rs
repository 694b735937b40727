//! Request-scoped registry of loaders.
//!
//! A [`BatchCoordinator`] lives for one execution. It hands out one loader
//! per logical fetch and context, so every resolver asking for "the author
//! of this post" during the execution lands in the same batch window.
//!
//! Loaders for plain fetches are identified by a caller-supplied [`FnKey`]
//! together with the fetch function, key and value types and the
//! [`ContextKey`]. The type alone is not enough: a factory returning
//! `impl Fn` yields one type for every capture. Query-join loaders are
//! identified by their structural [`QueryJoinKey`] and the context.

use crate::cache::{PipelineCache, QueryJoinKey};
use crate::config::BatchConfig;
use crate::join::{JoinDeclaration, QueryJoinLoader};
use crate::loader::{FetchFn, KeyedBatchLoader, ResultMap};
use batchql_core::{
    BatchError, BatchResult, BoxError, ContextKey, FnKey, Instrumentation, JoinKey, StepName,
    TracingInstrumentation,
};
use futures::Stream;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identity of one logical batched fetch within a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchIdentity {
    name: FnKey,
    fetch: TypeId,
    key: TypeId,
    value: TypeId,
    context: ContextKey,
}

impl FetchIdentity {
    fn of<F: 'static, K: 'static, V: 'static>(name: FnKey, context: ContextKey) -> Self {
        Self {
            name,
            fetch: TypeId::of::<F>(),
            key: TypeId::of::<K>(),
            value: TypeId::of::<V>(),
            context,
        }
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

/// Memoizes loaders for one execution.
pub struct BatchCoordinator {
    config: BatchConfig,
    pipelines: Arc<PipelineCache>,
    instrumentation: Arc<dyn Instrumentation>,
    loaders: Mutex<FxHashMap<FetchIdentity, Entry>>,
    joins: Mutex<FxHashMap<(QueryJoinKey, ContextKey), Entry>>,
}

impl BatchCoordinator {
    /// Creates a coordinator with its own pipeline cache.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidArgument`] if `config` is invalid.
    pub fn new(config: BatchConfig) -> BatchResult<Self> {
        let pipelines = Arc::new(PipelineCache::bounded(config.pipeline_cache_capacity));
        Self::with_pipeline_cache(config, pipelines)
    }

    /// Creates a coordinator sharing `pipelines` with other coordinators.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidArgument`] if `config` is invalid.
    pub fn with_pipeline_cache(config: BatchConfig, pipelines: Arc<PipelineCache>) -> BatchResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pipelines,
            instrumentation: Arc::new(TracingInstrumentation),
            loaders: Mutex::new(FxHashMap::default()),
            joins: Mutex::new(FxHashMap::default()),
        })
    }

    /// Replaces the instrumentation used by loaders built from now on.
    #[must_use]
    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Batching configuration handed to every loader this coordinator builds.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Pipeline cache backing query-join loaders.
    pub fn pipeline_cache(&self) -> &Arc<PipelineCache> {
        &self.pipelines
    }

    /// Returns the loader for a synchronous fetch.
    ///
    /// `key` names the fetch: calls with the same key, fetch type and
    /// context share one loader, and the `fetch` passed to later calls is
    /// dropped unused. Distinct fetch functions need distinct keys.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::TypeMismatch`] if the identity is already
    /// bound to a loader of other types.
    pub fn get_sync<K, V, F>(
        &self,
        key: impl Into<FnKey>,
        step: impl Into<StepName>,
        context: impl Into<ContextKey>,
        fetch: F,
    ) -> BatchResult<Arc<KeyedBatchLoader<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Default + Send + Sync + 'static,
        F: Fn(&[K]) -> Result<ResultMap<K, V>, BoxError> + Send + Sync + 'static,
    {
        let identity = FetchIdentity::of::<F, K, V>(key.into(), context.into());
        self.memoized(identity, || (step.into(), FetchFn::sync(fetch)))
    }

    /// Returns the loader for a future-returning fetch.
    ///
    /// # Errors
    ///
    /// See [`get_sync`](Self::get_sync).
    pub fn get_future<K, V, F, Fut>(
        &self,
        key: impl Into<FnKey>,
        step: impl Into<StepName>,
        context: impl Into<ContextKey>,
        fetch: F,
    ) -> BatchResult<Arc<KeyedBatchLoader<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Default + Send + Sync + 'static,
        F: Fn(Vec<K>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResultMap<K, V>, BoxError>> + Send + 'static,
    {
        let identity = FetchIdentity::of::<F, K, V>(key.into(), context.into());
        self.memoized(identity, || (step.into(), FetchFn::future(fetch)))
    }

    /// Returns the loader for a streaming fetch.
    ///
    /// # Errors
    ///
    /// See [`get_sync`](Self::get_sync).
    pub fn get_stream<K, V, F, S>(
        &self,
        key: impl Into<FnKey>,
        step: impl Into<StepName>,
        context: impl Into<ContextKey>,
        fetch: F,
    ) -> BatchResult<Arc<KeyedBatchLoader<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Default + Send + Sync + 'static,
        F: Fn(Vec<K>, CancellationToken) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<(K, V), BoxError>> + Send + 'static,
    {
        let identity = FetchIdentity::of::<F, K, V>(key.into(), context.into());
        self.memoized(identity, || (step.into(), FetchFn::stream(fetch)))
    }

    fn memoized<K, V, B>(&self, identity: FetchIdentity, build: B) -> BatchResult<Arc<KeyedBatchLoader<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Default + Send + Sync + 'static,
        B: FnOnce() -> (StepName, FetchFn<K, V>),
    {
        let mut loaders = self.loaders.lock();
        if let Some(entry) = loaders.get(&identity) {
            return downcast(&identity.context, Arc::clone(entry));
        }

        let (step, fetch) = build();
        debug!(step = %step.render(), context = %identity.context, "building loader");
        let mut builder = KeyedBatchLoader::builder(step, fetch)
            .default_with(|_: &K| V::default())
            .instrumentation(Arc::clone(&self.instrumentation));
        if let Some(max) = self.config.max_batch_size {
            builder = builder.max_batch_size(max);
        }
        let loader = Arc::new(builder.build()?);
        loaders.insert(identity, Arc::clone(&loader) as Entry);
        Ok(loader)
    }

    /// Returns the loader for a query-join declaration.
    ///
    /// Equal declarations share one compiled pipeline through the pipeline
    /// cache and, within this coordinator and context, one loader. The shared
    /// loader keeps the `step` of the call that built it: a later call with an
    /// equal declaration under another step name gets that loader back, and
    /// its faults are reported under the first step.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::TypeMismatch`] if a cached entry holds other
    /// types.
    pub fn get_join<P, PK, C, CK, T>(
        &self,
        step: impl Into<StepName>,
        context: impl Into<ContextKey>,
        declaration: JoinDeclaration<P, PK, C, CK, T>,
    ) -> BatchResult<Arc<QueryJoinLoader<P, PK, T>>>
    where
        P: Clone + Send + Sync + 'static,
        PK: JoinKey,
        C: Send + Sync + 'static,
        CK: JoinKey<Inner = PK::Inner>,
        T: Clone + Send + Sync + 'static,
    {
        let key = declaration.cache_key();
        let slot = (key, context.into());

        let mut joins = self.joins.lock();
        if let Some(entry) = joins.get(&slot) {
            return downcast(&slot.1, Arc::clone(entry));
        }

        let pipeline = self
            .pipelines
            .get_or_build(&slot.0, || declaration.compile())?;
        let step = step.into();
        debug!(step = %step.render(), join = %slot.0, context = %slot.1, "building join loader");
        let loader = Arc::new(declaration.into_loader(
            pipeline,
            step,
            self.config.max_batch_size,
            Arc::clone(&self.instrumentation),
        )?);
        joins.insert(slot, Arc::clone(&loader) as Entry);
        Ok(loader)
    }

    /// Forgets every memoized loader. The pipeline cache is kept.
    pub fn reset(&self) {
        self.loaders.lock().clear();
        self.joins.lock().clear();
        debug!("coordinator reset");
    }

    /// Number of memoized loaders, plain and join.
    pub fn loader_count(&self) -> usize {
        self.loaders.lock().len() + self.joins.lock().len()
    }
}

impl Default for BatchCoordinator {
    fn default() -> Self {
        Self {
            config: BatchConfig::default(),
            pipelines: Arc::new(PipelineCache::new()),
            instrumentation: Arc::new(TracingInstrumentation),
            loaders: Mutex::new(FxHashMap::default()),
            joins: Mutex::new(FxHashMap::default()),
        }
    }
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("config", &self.config)
            .field("pipelines", &self.pipelines)
            .field("loaders", &self.loader_count())
            .finish()
    }
}

fn downcast<T: Any + Send + Sync>(context: &ContextKey, entry: Entry) -> BatchResult<Arc<T>> {
    entry.downcast::<T>().map_err(|_| BatchError::TypeMismatch {
        identity: context.to_string(),
        expected: "memoized loader",
        requested: type_name::<T>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{Grouping, JoinQuery};
    use batchql_core::property_path;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lengths(keys: &[String]) -> Result<ResultMap<String, usize>, BoxError> {
        Ok(keys.iter().map(|k| (k.clone(), k.len())).collect())
    }

    #[test]
    fn test_same_fetch_same_context_is_memoized() {
        let coordinator = BatchCoordinator::default();

        let a = coordinator.get_sync("lengths", "len", "req", lengths).unwrap();
        let b = coordinator.get_sync("lengths", "len", "req", lengths).unwrap();
        let other = coordinator.get_sync("lengths", "len", "other", lengths).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(coordinator.loader_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_lookups_share_window() {
        let coordinator = BatchCoordinator::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut deferreds = Vec::new();
        for id in [1_u32, 2, 1, 3] {
            let counter = Arc::clone(&calls);
            let fetch = move |keys: Vec<u32>, _cancel: CancellationToken| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, BoxError>(keys.into_iter().map(|k| (k, k * 2)).collect::<ResultMap<_, _>>()) }
            };
            let loader = coordinator.get_future("double", "double", 7_u64, fetch).unwrap();
            deferreds.push(loader.load(id));
        }

        let mut values = Vec::new();
        for deferred in &deferreds {
            values.push(deferred.get(&cancel).await.unwrap());
        }
        assert_eq!(values, vec![2, 4, 2, 6]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn scaled(factor: i64) -> impl Fn(&[i64]) -> Result<ResultMap<i64, i64>, BoxError> + Send + Sync + 'static {
        move |keys: &[i64]| Ok(keys.iter().map(|k| (*k, k * factor)).collect())
    }

    #[tokio::test]
    async fn test_fetches_of_one_type_are_told_apart_by_key() {
        let coordinator = BatchCoordinator::default();
        let cancel = CancellationToken::new();

        let tens = coordinator.get_sync("Item.tens", "Item.tens", "req", scaled(10)).unwrap();
        let hundreds = coordinator.get_sync("Item.hundreds", "Item.hundreds", "req", scaled(100)).unwrap();
        let again = coordinator.get_sync("Item.tens", "Item.tens", "req", scaled(10)).unwrap();

        assert!(!Arc::ptr_eq(&tens, &hundreds));
        assert!(Arc::ptr_eq(&tens, &again));
        assert_eq!(coordinator.loader_count(), 2);

        let tens_handle = tens.load(3);
        let hundreds_handle = hundreds.load(3);
        let (t, h) = futures::join!(tens_handle.get(&cancel), hundreds_handle.get(&cancel));
        assert_eq!(t.unwrap(), 30);
        assert_eq!(h.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_stream_loader() {
        let coordinator = BatchCoordinator::default();
        let loader = coordinator
            .get_stream("echo", "echo", "req", |keys: Vec<i32>, _cancel| {
                stream::iter(keys.into_iter().map(|k| Ok::<_, BoxError>((k, k.to_string()))))
            })
            .unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(loader.load(5).get(&cancel).await.unwrap(), "5");
    }

    #[test]
    fn test_reset_forgets_loaders() {
        let coordinator = BatchCoordinator::default();
        let before = coordinator.get_sync("lengths", "len", "req", lengths).unwrap();
        coordinator.reset();
        assert_eq!(coordinator.loader_count(), 0);

        let after = coordinator.get_sync("lengths", "len", "req", lengths).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_invalid_config() {
        let err = BatchCoordinator::new(BatchConfig::new().with_max_batch_size(0)).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Team {
        id: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Member {
        team_id: u32,
        name: &'static str,
    }

    fn members(query: JoinQuery<u32>) -> futures::future::Ready<Result<Vec<Member>, BoxError>> {
        let all = [
            Member { team_id: 1, name: "ada" },
            Member { team_id: 2, name: "bob" },
            Member { team_id: 1, name: "cy" },
        ];
        futures::future::ready(Ok(all
            .into_iter()
            .filter(|m| query.keys.contains(&m.team_id))
            .collect()))
    }

    fn declaration() -> JoinDeclaration<Team, u32, Member, u32, Member> {
        JoinDeclaration::new(
            property_path!(Team => id),
            property_path!(Member => team_id),
            members,
        )
    }

    #[tokio::test]
    async fn test_join_loader_is_memoized_per_context() {
        let pipelines = Arc::new(PipelineCache::new());
        let first = BatchCoordinator::with_pipeline_cache(BatchConfig::default(), Arc::clone(&pipelines)).unwrap();
        let second = BatchCoordinator::with_pipeline_cache(BatchConfig::default(), Arc::clone(&pipelines)).unwrap();

        let a = first.get_join("Team.members", "req", declaration()).unwrap();
        let b = first.get_join("Team.members", "req", declaration()).unwrap();
        let c = second.get_join("Team.members", "req", declaration()).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pipelines.len(), 1);

        let cancel = CancellationToken::new();
        let team: Grouping<Team, Member> = a.load(Team { id: 1 }).get(&cancel).await.unwrap();
        assert_eq!(team.iter().map(|m| m.name).collect::<Vec<_>>(), vec!["ada", "cy"]);
    }

    fn labelled(prefix: &'static str) -> impl Fn(Member) -> String + Send + Sync + 'static {
        move |m: Member| format!("{prefix}{}", m.name)
    }

    #[tokio::test]
    async fn test_transforms_from_one_factory_do_not_share_pipeline() {
        let pipelines = Arc::new(PipelineCache::new());
        let first = BatchCoordinator::with_pipeline_cache(BatchConfig::default(), Arc::clone(&pipelines)).unwrap();
        let second = BatchCoordinator::with_pipeline_cache(BatchConfig::default(), Arc::clone(&pipelines)).unwrap();
        let cancel = CancellationToken::new();

        let titles = first
            .get_join("Team.titles", "req", declaration().transform("title", labelled("title-")))
            .unwrap();
        let slugs = second
            .get_join("Team.slugs", "req", declaration().transform("slug", labelled("slug-")))
            .unwrap();
        assert_eq!(pipelines.len(), 2);

        let titles = titles.load(Team { id: 2 }).get(&cancel).await.unwrap();
        let slugs = slugs.load(Team { id: 2 }).get(&cancel).await.unwrap();
        assert_eq!(titles.items, vec!["title-bob".to_string()]);
        assert_eq!(slugs.items, vec!["slug-bob".to_string()]);

        let third = BatchCoordinator::with_pipeline_cache(BatchConfig::default(), Arc::clone(&pipelines)).unwrap();
        third
            .get_join("Team.titles", "req", declaration().transform("title", labelled("title-")))
            .unwrap();
        assert_eq!(pipelines.len(), 2);
    }
}
