//! Key-based grouping joins between two collections.
//!
//! A query-join answers "for this parent, which children carry its key?"
//! with one batched query per window. The compiled part of a join (child key
//! accessor, ordering, element transform) lives in a [`JoinPipeline`] that
//! is shared through the [`PipelineCache`](crate::cache::PipelineCache);
//! the per-coordinator part (query function, hooks, batch window) is a
//! [`QueryJoinLoader`] built on top of it.

use crate::cache::QueryJoinKey;
use crate::deferred::Deferred;
use crate::loader::{FetchFn, KeyedBatchLoader, Load, ResultMap};
use batchql_core::{
    BatchResult, BoxError, FnKey, Instrumentation, JoinKey, PathExpr, PropertyPath, StepName,
};
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use std::any::{type_name, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A key plus the items that share it, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping<K, T> {
    pub key: K,
    pub items: Vec<T>,
}

impl<K, T> Grouping<K, T> {
    /// A grouping with no items.
    pub fn empty(key: K) -> Self {
        Self {
            key,
            items: Vec::new(),
        }
    }

    /// Number of items in the group.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no item carries the key.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates the items in pipeline order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<K, T> IntoIterator for Grouping<K, T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Sort direction of one ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One ordering term as seen by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub path: PathExpr,
    pub direction: SortDirection,
}

type Comparator<C> = dyn Fn(&C, &C) -> Ordering + Send + Sync;

/// Ordering applied to fetched children before they are grouped.
///
/// Carries both a descriptor (part of the pipeline identity and handed to
/// the backend) and the comparator applied in process. The in-process sort
/// is stable, so rows with equal sort keys keep the backend's order.
pub struct OrderBy<C> {
    terms: Vec<SortKey>,
    compare: Arc<Comparator<C>>,
}

impl<C: 'static> OrderBy<C> {
    /// Orders by `path`, smallest first.
    pub fn asc<P: Ord + 'static>(path: PropertyPath<C, P>) -> Self {
        Self::term(path, SortDirection::Ascending)
    }

    /// Orders by `path`, largest first.
    pub fn desc<P: Ord + 'static>(path: PropertyPath<C, P>) -> Self {
        Self::term(path, SortDirection::Descending)
    }

    /// Adds an ascending tie-breaker.
    #[must_use]
    pub fn then_asc<P: Ord + 'static>(self, path: PropertyPath<C, P>) -> Self {
        self.then(Self::asc(path))
    }

    /// Adds a descending tie-breaker.
    #[must_use]
    pub fn then_desc<P: Ord + 'static>(self, path: PropertyPath<C, P>) -> Self {
        self.then(Self::desc(path))
    }

    fn term<P: Ord + 'static>(path: PropertyPath<C, P>, direction: SortDirection) -> Self {
        let terms = vec![SortKey {
            path: path.normalized().clone(),
            direction,
        }];
        let compare = move |a: &C, b: &C| {
            let ordering = path.get(a).cmp(&path.get(b));
            match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        };
        Self {
            terms,
            compare: Arc::new(compare),
        }
    }

    fn then(mut self, next: Self) -> Self {
        self.terms.extend(next.terms);
        let first = self.compare;
        let second = next.compare;
        self.compare = Arc::new(move |a: &C, b: &C| first(a, b).then_with(|| second(a, b)));
        self
    }
}

impl<C> OrderBy<C> {
    /// Sort keys from most to least significant.
    pub fn terms(&self) -> &[SortKey] {
        &self.terms
    }

    /// Stable-sorts `rows` in place.
    pub fn sort(&self, rows: &mut [C]) {
        rows.sort_by(|a, b| (self.compare)(a, b));
    }
}

impl<C> Clone for OrderBy<C> {
    fn clone(&self) -> Self {
        Self {
            terms: self.terms.clone(),
            compare: Arc::clone(&self.compare),
        }
    }
}

impl<C> fmt::Debug for OrderBy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBy").field("terms", &self.terms).finish()
    }
}

type RowFilter<C> = dyn Fn(&C) -> bool + Send + Sync;
type LoadedHook = dyn Fn(usize) + Send + Sync;

/// Optional callbacks around a join fetch.
///
/// Hooks belong to the loader, not to the cached pipeline: they do not take
/// part in the structural identity and the first declaration seen by a
/// coordinator supplies them.
pub struct JoinHooks<C> {
    filter: Option<Arc<RowFilter<C>>>,
    on_loaded: Option<Arc<LoadedHook>>,
}

impl<C> JoinHooks<C> {
    /// Hooks that keep every row and observe nothing.
    pub fn new() -> Self {
        Self {
            filter: None,
            on_loaded: None,
        }
    }

    /// Drops fetched rows for which `filter` returns false.
    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Observes the number of rows returned by each fetch.
    #[must_use]
    pub fn on_loaded<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_loaded = Some(Arc::new(hook));
        self
    }
}

impl<C> Default for JoinHooks<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for JoinHooks<C> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            on_loaded: self.on_loaded.clone(),
        }
    }
}

impl<C> fmt::Debug for JoinHooks<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHooks")
            .field("filter", &self.filter.is_some())
            .field("on_loaded", &self.on_loaded.is_some())
            .finish()
    }
}

/// The query handed to a join's backend for one window.
#[derive(Debug, Clone)]
pub struct JoinQuery<K> {
    /// Distinct, non-null child keys of the window.
    pub keys: Vec<K>,
    /// Normalized child property the keys refer to.
    pub child_path: PathExpr,
    /// Requested ordering, outermost term first.
    pub order: Vec<SortKey>,
    pub cancel: CancellationToken,
}

type QueryFn<K, C> =
    dyn Fn(JoinQuery<K>) -> BoxFuture<'static, Result<Vec<C>, BoxError>> + Send + Sync;

/// Identity of an element transform: the caller's key plus the function
/// type. `None` is the untransformed join.
type TransformId = Option<(FnKey, TypeId)>;

struct Transform<C, T> {
    id: TransformId,
    apply: Arc<dyn Fn(C) -> T + Send + Sync>,
}

impl<C, T> Clone for Transform<C, T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            apply: Arc::clone(&self.apply),
        }
    }
}

/// A query-join as declared by a field.
///
/// Two declarations built independently with equal property paths, the same
/// types, the same ordering descriptor and the same transform produce equal
/// [`QueryJoinKey`]s and therefore share a pipeline and a loader.
pub struct JoinDeclaration<P, PK, C, CK: JoinKey, T> {
    parent_key: PropertyPath<P, PK>,
    child_key: PropertyPath<C, CK>,
    query: Arc<QueryFn<CK::Inner, C>>,
    transform: Transform<C, T>,
    order: Option<OrderBy<C>>,
    hooks: JoinHooks<C>,
}

impl<P, PK, C, CK> JoinDeclaration<P, PK, C, CK, C>
where
    P: Clone + Send + Sync + 'static,
    PK: JoinKey,
    C: Send + Sync + 'static,
    CK: JoinKey<Inner = PK::Inner>,
{
    /// Declares a join of parents to the children whose `child_key` equals
    /// the parent's `parent_key`. `query` fetches the children of a window.
    pub fn new<Q, Fut>(
        parent_key: PropertyPath<P, PK>,
        child_key: PropertyPath<C, CK>,
        query: Q,
    ) -> Self
    where
        Q: Fn(JoinQuery<CK::Inner>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<C>, BoxError>> + Send + 'static,
    {
        Self {
            parent_key,
            child_key,
            query: Arc::new(move |join_query| query(join_query).boxed()),
            transform: Transform {
                id: None,
                apply: Arc::new(|child: C| child),
            },
            order: None,
            hooks: JoinHooks::new(),
        }
    }

    /// Transforms every child before it is grouped.
    ///
    /// `key` names the transform. Declarations whose transforms share a key
    /// and a function type share a pipeline, so transforms built by one
    /// factory with different captures need different keys.
    pub fn transform<T, F>(self, key: impl Into<FnKey>, transform: F) -> JoinDeclaration<P, PK, C, CK, T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(C) -> T + Send + Sync + 'static,
    {
        JoinDeclaration {
            parent_key: self.parent_key,
            child_key: self.child_key,
            query: self.query,
            transform: Transform {
                id: Some((key.into(), TypeId::of::<F>())),
                apply: Arc::new(transform),
            },
            order: self.order,
            hooks: self.hooks,
        }
    }
}

impl<P, PK, C, CK, T> JoinDeclaration<P, PK, C, CK, T>
where
    P: Clone + Send + Sync + 'static,
    PK: JoinKey,
    C: Send + Sync + 'static,
    CK: JoinKey<Inner = PK::Inner>,
    T: Clone + Send + Sync + 'static,
{
    /// Orders the rows of every group.
    #[must_use]
    pub fn order_by(mut self, order: OrderBy<C>) -> Self {
        self.order = Some(order);
        self
    }

    /// Replaces the fetch hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: JoinHooks<C>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The structural identity of this declaration.
    pub fn cache_key(&self) -> QueryJoinKey {
        QueryJoinKey {
            parent: TypeId::of::<P>(),
            child: TypeId::of::<C>(),
            output: TypeId::of::<T>(),
            parent_key: TypeId::of::<PK>(),
            child_key: TypeId::of::<CK>(),
            parent_path: self.parent_key.normalized().clone(),
            child_path: self.child_key.normalized().clone(),
            key_kind: CK::KIND,
            transform: self.transform.id.clone(),
            order: self
                .order
                .as_ref()
                .map(|order| order.terms().to_vec())
                .unwrap_or_default(),
            names: (type_name::<P>(), type_name::<C>()),
        }
    }

    pub(crate) fn compile(&self) -> JoinPipeline<C, CK, T> {
        JoinPipeline {
            child_key: self.child_key.clone(),
            order: self.order.clone(),
            transform: self.transform.clone(),
        }
    }

    pub(crate) fn into_loader(
        self,
        pipeline: Arc<JoinPipeline<C, CK, T>>,
        step: StepName,
        max_batch_size: Option<usize>,
        instrumentation: Arc<dyn Instrumentation>,
    ) -> BatchResult<QueryJoinLoader<P, PK, T>> {
        let query = self.query;
        let hooks = self.hooks;
        let fetch = FetchFn::future(move |keys: Vec<CK::Inner>, cancel: CancellationToken| {
            let rows = query(pipeline.query(keys, cancel));
            let pipeline = Arc::clone(&pipeline);
            let hooks = hooks.clone();
            async move {
                let rows = rows.await?;
                Ok::<_, BoxError>(pipeline.group(rows, &hooks))
            }
        });

        let mut builder = KeyedBatchLoader::builder(step, fetch)
            .default_with(|key: &CK::Inner| Grouping::empty(key.clone()))
            .instrumentation(instrumentation);
        if let Some(max) = max_batch_size {
            builder = builder.max_batch_size(max);
        }

        Ok(QueryJoinLoader {
            parent_key: self.parent_key,
            groups: Arc::new(builder.build()?),
        })
    }
}

impl<P, PK, C, CK: JoinKey, T> fmt::Debug for JoinDeclaration<P, PK, C, CK, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinDeclaration")
            .field("parent_key", &self.parent_key)
            .field("child_key", &self.child_key)
            .field("order", &self.order)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// The compiled, shareable part of a join.
pub struct JoinPipeline<C, CK, T> {
    child_key: PropertyPath<C, CK>,
    order: Option<OrderBy<C>>,
    transform: Transform<C, T>,
}

impl<C, CK: JoinKey, T> JoinPipeline<C, CK, T> {
    fn query(&self, keys: Vec<CK::Inner>, cancel: CancellationToken) -> JoinQuery<CK::Inner> {
        JoinQuery {
            keys,
            child_path: self.child_key.normalized().clone(),
            order: self
                .order
                .as_ref()
                .map(|order| order.terms().to_vec())
                .unwrap_or_default(),
            cancel,
        }
    }

    /// Filters, orders, transforms and groups one window's rows.
    ///
    /// Groups appear in first-seen order; rows whose child key is null are
    /// dropped since no parent can match them.
    fn group(
        &self,
        mut rows: Vec<C>,
        hooks: &JoinHooks<C>,
    ) -> ResultMap<CK::Inner, Grouping<CK::Inner, T>> {
        if let Some(on_loaded) = &hooks.on_loaded {
            on_loaded(rows.len());
        }
        if let Some(filter) = &hooks.filter {
            rows.retain(|row| filter(row));
        }
        if let Some(order) = &self.order {
            order.sort(&mut rows);
        }

        let mut groups: IndexMap<CK::Inner, Vec<T>> = IndexMap::new();
        for row in rows {
            let Some(key) = self.child_key.get(&row).into_inner() else {
                continue;
            };
            groups
                .entry(key)
                .or_default()
                .push((self.transform.apply)(row));
        }
        trace!(groups = groups.len(), "grouped join rows");

        groups
            .into_iter()
            .map(|(key, items)| (key.clone(), Grouping { key, items }))
            .collect()
    }
}

impl<C, CK, T> fmt::Debug for JoinPipeline<C, CK, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinPipeline")
            .field("child_key", &self.child_key)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Loads the children of a parent entity.
///
/// The parent's key is unwrapped to the shared inner key type; a null key
/// resolves immediately to an empty grouping and never reaches the batch
/// window. Results are keyed by the parent itself.
pub struct QueryJoinLoader<P, PK: JoinKey, T> {
    parent_key: PropertyPath<P, PK>,
    groups: Arc<KeyedBatchLoader<PK::Inner, Grouping<PK::Inner, T>>>,
}

impl<P, PK, T> QueryJoinLoader<P, PK, T>
where
    P: Clone + Send + Sync + 'static,
    PK: JoinKey,
    T: Clone + Send + Sync + 'static,
{
    /// Defers the children of `parent`, grouped under the parent itself.
    pub fn load(&self, parent: P) -> Deferred<Grouping<P, T>> {
        let Some(key) = self.parent_key.get(&parent).into_inner() else {
            return Deferred::ready(Grouping::empty(parent));
        };
        self.groups.load(key).map(move |grouping| Grouping {
            key: parent.clone(),
            items: grouping.items,
        })
    }

    /// Keys waiting in the current window.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.groups.pending_len()
    }
}

impl<P, PK, T> Load<P> for QueryJoinLoader<P, PK, T>
where
    P: Clone + Send + Sync + 'static,
    PK: JoinKey,
    T: Clone + Send + Sync + 'static,
{
    type Value = Grouping<P, T>;

    fn load(&self, parent: P) -> Deferred<Grouping<P, T>> {
        QueryJoinLoader::load(self, parent)
    }
}

impl<P, PK: JoinKey, T> fmt::Debug for QueryJoinLoader<P, PK, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryJoinLoader")
            .field("parent_key", &self.parent_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchql_core::{property_path, TracingInstrumentation};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Debug, Clone, PartialEq)]
    struct Author {
        id: i64,
        editor_id: Option<i64>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Post {
        id: i64,
        author_id: i64,
        reviewer_id: Option<i64>,
        rank: u32,
    }

    fn post(id: i64, author_id: i64, rank: u32) -> Post {
        Post {
            id,
            author_id,
            reviewer_id: Some(author_id),
            rank,
        }
    }

    fn table() -> Vec<Post> {
        vec![post(1, 10, 2), post(2, 20, 1), post(3, 10, 1), post(4, 10, 2)]
    }

    type Queries = Arc<Mutex<Vec<JoinQuery<i64>>>>;

    fn posts_by(
        queries: &Queries,
    ) -> impl Fn(JoinQuery<i64>) -> futures::future::Ready<Result<Vec<Post>, BoxError>> {
        let queries = Arc::clone(queries);
        move |query: JoinQuery<i64>| {
            let rows = table()
                .into_iter()
                .filter(|p| query.keys.contains(&p.author_id))
                .collect();
            queries.lock().push(query);
            futures::future::ready(Ok(rows))
        }
    }

    fn build<T, PK, CK>(
        declaration: JoinDeclaration<Author, PK, Post, CK, T>,
    ) -> QueryJoinLoader<Author, PK, T>
    where
        T: Clone + Send + Sync + 'static,
        PK: JoinKey<Inner = i64>,
        CK: JoinKey<Inner = PK::Inner>,
    {
        let pipeline = Arc::new(declaration.compile());
        declaration
            .into_loader(
                pipeline,
                StepName::fixed("Author.posts"),
                None,
                Arc::new(TracingInstrumentation),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_groups_children_by_parent_key() {
        let queries = Queries::default();
        let loader = build(JoinDeclaration::new(
            property_path!(Author => id),
            property_path!(Post => author_id),
            posts_by(&queries),
        ));
        let cancel = CancellationToken::new();

        let a = Author { id: 10, editor_id: None };
        let b = Author { id: 20, editor_id: None };
        let nobody = Author { id: 99, editor_id: None };
        let (ga, gb, gn) = (loader.load(a.clone()), loader.load(b.clone()), loader.load(nobody.clone()));

        let ga = ga.get(&cancel).await.unwrap();
        assert_eq!(ga.key, a);
        assert_eq!(ga.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(gb.get(&cancel).await.unwrap().len(), 1);

        let empty = gn.get(&cancel).await.unwrap();
        assert_eq!(empty.key, nobody);
        assert!(empty.is_empty());

        let queries = queries.lock();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].keys, vec![10, 20, 99]);
        assert_eq!(queries[0].child_path.to_string(), "x.author_id");
    }

    #[tokio::test]
    async fn test_null_parent_key_short_circuits() {
        let queries = Queries::default();
        let loader = build(JoinDeclaration::new(
            property_path!(Author => editor_id),
            property_path!(Post => author_id),
            posts_by(&queries),
        ));
        let cancel = CancellationToken::new();

        let orphan = Author { id: 1, editor_id: None };
        let grouping = loader.load(orphan.clone());
        assert_eq!(loader.pending_len(), 0);
        assert!(grouping.is_resolved());

        let grouping = grouping.get(&cancel).await.unwrap();
        assert_eq!(grouping, Grouping::empty(orphan));
        assert!(queries.lock().is_empty());

        let edited = loader.load(Author { id: 2, editor_id: Some(20) });
        assert_eq!(edited.get(&cancel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nullable_child_key() {
        let queries = Queries::default();
        let loader = build(JoinDeclaration::new(
            property_path!(Author => id),
            property_path!(Post => reviewer_id),
            move |query: JoinQuery<i64>| {
                let mut rows = table();
                rows.push(Post {
                    id: 5,
                    author_id: 10,
                    reviewer_id: None,
                    rank: 0,
                });
                queries.lock().push(query);
                async move { Ok::<_, BoxError>(rows) }
            },
        ));
        let cancel = CancellationToken::new();

        let grouping = loader.load(Author { id: 10, editor_id: None });
        let ids: Vec<_> = grouping.get(&cancel).await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_order_transform_and_hooks() {
        let queries = Queries::default();
        let loaded = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&loaded);

        let declaration = JoinDeclaration::new(
            property_path!(Author => id),
            property_path!(Post => author_id),
            posts_by(&queries),
        )
        .order_by(OrderBy::asc(property_path!(Post => rank)).then_desc(property_path!(Post => id)))
        .hooks(
            JoinHooks::new()
                .filter(|p: &Post| p.id != 4)
                .on_loaded(move |rows| {
                    seen.fetch_add(rows, AtomicOrdering::SeqCst);
                }),
        )
        .transform("post-title", |p: Post| format!("post-{}", p.id));
        let loader = build(declaration);
        let cancel = CancellationToken::new();

        let titles = loader
            .load(Author { id: 10, editor_id: None })
            .get(&cancel)
            .await
            .unwrap();
        assert_eq!(titles.items, vec!["post-3".to_string(), "post-1".to_string()]);
        assert_eq!(loaded.load(AtomicOrdering::SeqCst), 3);

        let queries = queries.lock();
        assert_eq!(queries[0].order.len(), 2);
        assert_eq!(queries[0].order[1].direction, SortDirection::Descending);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Account {
        handle: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Comment {
        id: u32,
        handle: String,
    }

    #[tokio::test]
    async fn test_optional_string_parent_joins_string_child() {
        let seen: Arc<Mutex<Vec<JoinQuery<String>>>> = Arc::default();
        let log = Arc::clone(&seen);
        let declaration = JoinDeclaration::new(
            property_path!(Account => handle),
            property_path!(Comment => handle),
            move |query: JoinQuery<String>| {
                let rows: Vec<Comment> = [(1, "ada"), (2, "bob"), (3, "ada")]
                    .into_iter()
                    .map(|(id, handle)| Comment { id, handle: handle.to_string() })
                    .filter(|c| query.keys.contains(&c.handle))
                    .collect();
                log.lock().push(query);
                futures::future::ready(Ok::<_, BoxError>(rows))
            },
        );
        assert_eq!(declaration.cache_key().key_kind(), batchql_core::JoinKeyKind::String);

        let pipeline = Arc::new(declaration.compile());
        let loader = declaration
            .into_loader(pipeline, StepName::fixed("Account.comments"), None, Arc::new(TracingInstrumentation))
            .unwrap();
        let cancel = CancellationToken::new();

        let anonymous = loader.load(Account { handle: None });
        assert!(anonymous.is_resolved());
        let ada = loader.load(Account { handle: Some("ada".into()) });
        let eve = loader.load(Account { handle: Some("eve".into()) });

        let ada = ada.get(&cancel).await.unwrap();
        assert_eq!(ada.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 3]);
        assert!(eve.get(&cancel).await.unwrap().is_empty());
        assert!(anonymous.get(&cancel).await.unwrap().is_empty());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].keys, vec!["ada".to_string(), "eve".to_string()]);
    }

    fn prefixed(prefix: &'static str) -> impl Fn(Post) -> String + Send + Sync + 'static {
        move |p: Post| format!("{prefix}{}", p.id)
    }

    #[test]
    fn test_transform_identity_follows_its_key() {
        let queries = Queries::default();
        let declare = |key: &str, prefix: &'static str| {
            JoinDeclaration::new(
                property_path!(Author => id),
                property_path!(Post => author_id),
                posts_by(&queries),
            )
            .transform(key, prefixed(prefix))
        };

        let title = declare("title", "title-");
        let slug = declare("slug", "slug-");
        let title_again = declare("title", "title-");

        assert_ne!(title.cache_key(), slug.cache_key());
        assert_eq!(title.cache_key(), title_again.cache_key());
    }

    #[test]
    fn test_stable_sort_keeps_backend_order() {
        let order = OrderBy::asc(property_path!(Post => rank));
        let mut rows = vec![post(7, 1, 1), post(8, 1, 0), post(9, 1, 1)];
        order.sort(&mut rows);
        assert_eq!(rows.iter().map(|p| p.id).collect::<Vec<_>>(), vec![8, 7, 9]);
    }

    #[test]
    fn test_equal_declarations_share_cache_key() {
        let queries = Queries::default();
        let first = JoinDeclaration::new(
            property_path!(Author => id),
            property_path!(Post => author_id),
            posts_by(&queries),
        );
        let second = JoinDeclaration::new(
            property_path!(Author => id),
            property_path!(Post => author_id),
            |_query: JoinQuery<i64>| async { Ok::<Vec<Post>, BoxError>(Vec::new()) },
        );
        let ordered = JoinDeclaration::new(
            property_path!(Author => id),
            property_path!(Post => author_id),
            posts_by(&queries),
        )
        .order_by(OrderBy::desc(property_path!(Post => rank)));

        assert_eq!(first.cache_key(), second.cache_key());
        assert_ne!(first.cache_key(), ordered.cache_key());
    }
}
