//! Structural pipeline cache for query-joins.
//!
//! Compiled join pipelines are keyed by the *shape* of their declaration
//! (types, normalized property paths, ordering descriptor, transform
//! identity), never by the identity of the objects that declared them.
//!
//! The cache is an explicit service: whoever owns a schema creates one and
//! hands it to every coordinator built for that schema. Entries are never
//! evicted. An optional capacity bounds the number of distinct shapes; once
//! it is reached, new shapes are compiled per coordinator and not retained.

use crate::join::SortKey;
use batchql_core::{BatchError, BatchResult, FnKey, JoinKeyKind, PathExpr};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Structural identity of a query-join declaration.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct QueryJoinKey {
    pub(crate) parent: TypeId,
    pub(crate) child: TypeId,
    pub(crate) output: TypeId,
    pub(crate) parent_key: TypeId,
    pub(crate) child_key: TypeId,
    pub(crate) parent_path: PathExpr,
    pub(crate) child_path: PathExpr,
    pub(crate) key_kind: JoinKeyKind,
    pub(crate) transform: Option<(FnKey, TypeId)>,
    pub(crate) order: Vec<SortKey>,
    pub(crate) names: (&'static str, &'static str),
}

impl QueryJoinKey {
    /// Normalized parent-side property path.
    pub fn parent_path(&self) -> &PathExpr {
        &self.parent_path
    }

    /// Normalized child-side property path.
    pub fn child_path(&self) -> &PathExpr {
        &self.child_path
    }

    /// Classification of the child join property.
    pub fn key_kind(&self) -> JoinKeyKind {
        self.key_kind
    }
}

impl fmt::Debug for QueryJoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryJoinKey")
            .field("parent", &self.names.0)
            .field("child", &self.names.1)
            .field("parent_path", &self.parent_path.to_string())
            .field("child_path", &self.child_path.to_string())
            .field("key_kind", &self.key_kind)
            .field("transform", &self.transform.as_ref().map(|(key, _)| key.as_str()))
            .field("order", &self.order.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for QueryJoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] => {}[{}]",
            self.names.0, self.parent_path, self.names.1, self.child_path
        )
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

/// Process- or schema-scoped store of compiled join pipelines.
pub struct PipelineCache {
    capacity: Option<usize>,
    entries: RwLock<FxHashMap<QueryJoinKey, Entry>>,
}

impl PipelineCache {
    /// An unbounded cache.
    #[must_use]
    pub fn new() -> Self {
        Self::bounded(None)
    }

    /// A cache holding at most `capacity` shapes when set.
    #[must_use]
    pub fn bounded(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the pipeline cached under `key`, compiling it with `build` on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::TypeMismatch`] if the entry under `key` holds a
    /// different pipeline type.
    pub fn get_or_build<T, F>(&self, key: &QueryJoinKey, build: F) -> BatchResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(entry) = self.entries.read().get(key) {
            return downcast(key, Arc::clone(entry));
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            return downcast(key, Arc::clone(entry));
        }

        let pipeline = Arc::new(build());
        match self.capacity {
            Some(capacity) if entries.len() >= capacity => {
                warn!(
                    join = %key,
                    capacity,
                    "pipeline cache is full; compiled pipeline will not be shared"
                );
            }
            _ => {
                debug!(join = %key, "compiled join pipeline");
                entries.insert(key.clone(), Arc::clone(&pipeline) as Entry);
            }
        }
        Ok(pipeline)
    }

    /// Whether a pipeline for `key` is cached.
    pub fn contains(&self, key: &QueryJoinKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of cached pipelines.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Maximum number of retained shapes, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

fn downcast<T: Any + Send + Sync>(key: &QueryJoinKey, entry: Entry) -> BatchResult<Arc<T>> {
    entry.downcast::<T>().map_err(|_| BatchError::TypeMismatch {
        identity: key.to_string(),
        expected: "cached join pipeline",
        requested: type_name::<T>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(child_path: &str) -> QueryJoinKey {
        QueryJoinKey {
            parent: TypeId::of::<u8>(),
            child: TypeId::of::<u16>(),
            output: TypeId::of::<u16>(),
            parent_key: TypeId::of::<i64>(),
            child_key: TypeId::of::<i64>(),
            parent_path: PathExpr::root().member("id"),
            child_path: PathExpr::root().member(child_path),
            key_kind: JoinKeyKind::Value,
            transform: None,
            order: Vec::new(),
            names: ("Parent", "Child"),
        }
    }

    #[test]
    fn test_builds_once() {
        let cache = PipelineCache::new();
        let mut builds = 0;

        let first = cache
            .get_or_build(&key("parent_id"), || {
                builds += 1;
                String::from("pipeline")
            })
            .unwrap();
        let second = cache
            .get_or_build(&key("parent_id"), || {
                builds += 1;
                String::from("other")
            })
            .unwrap();

        assert_eq!(builds, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_stops_inserting() {
        let cache = PipelineCache::bounded(Some(1));

        cache.get_or_build(&key("a"), || 1_u32).unwrap();
        let overflow = cache.get_or_build(&key("b"), || 2_u32).unwrap();

        assert_eq!(*overflow, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
    }

    #[test]
    fn test_type_mismatch() {
        let cache = PipelineCache::new();
        cache.get_or_build(&key("a"), || 1_u32).unwrap();

        let err = cache.get_or_build(&key("a"), || "text").unwrap_err();
        assert!(matches!(err, BatchError::TypeMismatch { .. }));
    }

    #[test]
    fn test_display() {
        assert_eq!(key("owner_id").to_string(), "Parent[x.id] => Child[x.owner_id]");
    }
}
