//! Continuation combinators over loaders.
//!
//! Combinators reshape what a loader returns without changing how it
//! batches: a mapped loader registers its keys in the wrapped loader's
//! window, so a derived field ("load the post, then project its title")
//! rides the same fetch as the original one.

use crate::deferred::Deferred;
use crate::loader::Load;
use batchql_core::{BatchError, BatchResult};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Combinator methods available on every loader.
pub trait LoadExt<K>: Load<K> + Sized {
    /// Transforms each loaded value.
    fn map<U, F>(self, f: F) -> Mapped<Self, F>
    where
        F: Fn(Self::Value) -> U + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
    {
        Mapped {
            inner: self,
            f: Arc::new(f),
        }
    }

    /// Transforms each loaded value together with the key it was loaded by.
    fn map_with_key<U, F>(self, f: F) -> MappedWithKey<Self, F, U>
    where
        K: Clone + Send + Sync + 'static,
        F: Fn(&K, Self::Value) -> U + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
    {
        MappedWithKey {
            inner: self,
            f: Arc::new(f),
            _output: PhantomData,
        }
    }
}

impl<K, L: Load<K>> LoadExt<K> for L {}

/// Loader returned by [`LoadExt::map`].
pub struct Mapped<L, F> {
    inner: L,
    f: Arc<F>,
}

impl<K, L, F, U> Load<K> for Mapped<L, F>
where
    L: Load<K>,
    F: Fn(L::Value) -> U + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    type Value = U;

    fn load(&self, key: K) -> Deferred<U> {
        let f = Arc::clone(&self.f);
        self.inner.load(key).map(move |value| f(value))
    }
}

/// Loader returned by [`LoadExt::map_with_key`].
pub struct MappedWithKey<L, F, U> {
    inner: L,
    f: Arc<F>,
    _output: PhantomData<fn() -> U>,
}

impl<K, L, F, U> Load<K> for MappedWithKey<L, F, U>
where
    K: Clone + Send + Sync + 'static,
    L: Load<K>,
    F: Fn(&K, L::Value) -> U + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    type Value = U;

    fn load(&self, key: K) -> Deferred<U> {
        let f = Arc::clone(&self.f);
        let original = key.clone();
        self.inner
            .load(key)
            .map(move |value| f(&original, value))
    }
}

/// Dispatches each request to one of two loaders.
///
/// The derived key is computed at load time and only the selected loader
/// sees it; the other branch's window is untouched.
pub struct Branch<D, S, P, T, E> {
    selector: S,
    predicate: P,
    on_true: T,
    on_false: E,
    _derived: PhantomData<fn() -> D>,
}

/// Builds a [`Branch`] loader.
pub fn branch<K, D, S, P, T, E>(selector: S, predicate: P, on_true: T, on_false: E) -> Branch<D, S, P, T, E>
where
    S: Fn(&K) -> D + Send + Sync,
    P: Fn(&D) -> bool + Send + Sync,
    T: Load<D>,
    E: Load<D, Value = T::Value>,
{
    Branch {
        selector,
        predicate,
        on_true,
        on_false,
        _derived: PhantomData,
    }
}

impl<K, D, S, P, T, E> Load<K> for Branch<D, S, P, T, E>
where
    S: Fn(&K) -> D + Send + Sync,
    P: Fn(&D) -> bool + Send + Sync,
    T: Load<D>,
    E: Load<D, Value = T::Value>,
{
    type Value = T::Value;

    fn load(&self, key: K) -> Deferred<T::Value> {
        let derived = (self.selector)(&key);
        if (self.predicate)(&derived) {
            self.on_true.load(derived)
        } else {
            self.on_false.load(derived)
        }
    }
}

/// A type-erased loader.
pub type DynLoader<K, V> = Arc<dyn Load<K, Value = V>>;

/// Fans one key out to several loaders; see [`combine_all`].
pub struct CombineAll<K, V> {
    loaders: Vec<DynLoader<K, V>>,
}

impl<K, V> fmt::Debug for CombineAll<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombineAll")
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

/// Issues every key to each loader and collects the results in declaration
/// order. Each participant keeps its own batch window.
///
/// # Errors
///
/// Returns [`BatchError::InvalidArgument`] if no loader is given.
pub fn combine_all<K, V>(loaders: impl IntoIterator<Item = DynLoader<K, V>>) -> BatchResult<CombineAll<K, V>> {
    let loaders: Vec<_> = loaders.into_iter().collect();
    if loaders.is_empty() {
        return Err(BatchError::invalid_argument("combine_all needs at least one loader"));
    }
    Ok(CombineAll { loaders })
}

impl<K, V> Load<K> for CombineAll<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync + 'static,
{
    type Value = Vec<V>;

    fn load(&self, key: K) -> Deferred<Vec<V>> {
        Deferred::join_all(
            self.loaders
                .iter()
                .map(|loader| loader.load(key.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{FetchFn, KeyedBatchLoader};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn counted(calls: &Arc<AtomicUsize>, scale: i64) -> KeyedBatchLoader<i64, i64> {
        let calls = Arc::clone(calls);
        KeyedBatchLoader::new(
            "scaled",
            FetchFn::sync(move |keys: &[i64]| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.iter().map(|k| (*k, k * scale)).collect())
            }),
        )
    }

    #[tokio::test]
    async fn test_map_rides_same_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(counted(&calls, 10));
        let doubled = Arc::clone(&loader).map(|v| v * 2);
        let cancel = CancellationToken::new();

        let plain = loader.load(1);
        let derived = doubled.load(2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(derived.get(&cancel).await.unwrap(), 40);
        assert_eq!(plain.get(&cancel).await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_map_with_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let labelled = counted(&calls, 3).map_with_key(|key, value| format!("{key}:{value}"));
        let cancel = CancellationToken::new();

        let deferred = labelled.load(4);
        assert_eq!(deferred.get(&cancel).await.unwrap(), "4:12");
    }

    #[tokio::test]
    async fn test_branch_only_touches_selected_loader() {
        let even_calls = Arc::new(AtomicUsize::new(0));
        let odd_calls = Arc::new(AtomicUsize::new(0));
        let even = Arc::new(counted(&even_calls, 100));
        let odd = Arc::new(counted(&odd_calls, -1));

        let routed = branch(
            |key: &i64| key / 10,
            |derived: &i64| derived % 2 == 0,
            Arc::clone(&even),
            Arc::clone(&odd),
        );
        let cancel = CancellationToken::new();

        let a = routed.load(20);
        let b = routed.load(40);
        assert_eq!(even.pending_len(), 2);
        assert_eq!(odd.pending_len(), 0);

        assert_eq!(a.get(&cancel).await.unwrap(), 200);
        assert_eq!(b.get(&cancel).await.unwrap(), 400);
        assert_eq!(even_calls.load(Ordering::SeqCst), 1);
        assert_eq!(odd_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_combine_all_order_and_single_fetch() {
        let slow_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&slow_calls);
        let slow: DynLoader<i64, i64> = Arc::new(KeyedBatchLoader::new(
            "slow",
            FetchFn::future(move |keys: Vec<i64>, _cancel| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, batchql_core::BoxError>(keys.into_iter().map(|k| (k, k + 1)).collect::<HashMap<_, _>>())
                }
            }),
        ));
        let fast_calls = Arc::new(AtomicUsize::new(0));
        let fast: DynLoader<i64, i64> = Arc::new(counted(&fast_calls, 2));

        let combined = combine_all([slow, fast]).unwrap();
        let cancel = CancellationToken::new();

        let first = combined.load(5);
        let second = combined.load(5);
        let third = combined.load(6);

        assert_eq!(first.get(&cancel).await.unwrap(), vec![6, 10]);
        assert_eq!(second.get(&cancel).await.unwrap(), vec![6, 10]);
        assert_eq!(third.get(&cancel).await.unwrap(), vec![7, 12]);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fast_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_combine_all_rejects_empty() {
        let err = combine_all(Vec::<DynLoader<i64, i64>>::new()).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }
}
