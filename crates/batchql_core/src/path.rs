//! Property-path descriptors.
//!
//! A [`PropertyPath`] pairs a small expression tree ([`PathExpr`]) with the
//! accessor that evaluates it. Equality and hashing look at the normalized
//! tree only, so two paths written the same way at different call sites
//! compare equal and can share cached pipelines.
//!
//! # Example
//!
//! ```
//! use batchql_core::property_path;
//!
//! struct Post { author_id: i64 }
//!
//! let a = property_path!(Post => author_id);
//! let b = property_path!(Post => author_id);
//! assert_eq!(a, b);
//! assert_eq!(a.get(&Post { author_id: 7 }), 7);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Expression tree describing a property access.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathExpr {
    /// The value the path is evaluated against.
    Root,
    /// A member access on `target`.
    Member {
        target: Box<PathExpr>,
        name: Arc<str>,
    },
    /// A type conversion of `target`. Stripped by normalization.
    Convert {
        target: Box<PathExpr>,
        to: Arc<str>,
    },
}

impl PathExpr {
    /// The root expression.
    #[must_use]
    pub const fn root() -> Self {
        Self::Root
    }

    /// Appends a member access.
    #[must_use]
    pub fn member(self, name: &str) -> Self {
        Self::Member {
            target: Box::new(self),
            name: Arc::from(name),
        }
    }

    /// Wraps the expression in a conversion node.
    #[must_use]
    pub fn convert(self, to: &str) -> Self {
        Self::Convert {
            target: Box::new(self),
            to: Arc::from(to),
        }
    }

    /// Returns the expression with every conversion node removed.
    #[must_use]
    pub fn normalize(&self) -> Self {
        match self {
            Self::Root => Self::Root,
            Self::Member { target, name } => Self::Member {
                target: Box::new(target.normalize()),
                name: Arc::clone(name),
            },
            Self::Convert { target, .. } => target.normalize(),
        }
    }

    /// Returns true if the expression contains no conversion node.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        match self {
            Self::Root => true,
            Self::Member { target, .. } => target.is_normalized(),
            Self::Convert { .. } => false,
        }
    }

    /// Member names from the root outwards, ignoring conversions.
    #[must_use]
    pub fn members(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_members(&mut names);
        names
    }

    fn collect_members<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Self::Root => {}
            Self::Member { target, name } => {
                target.collect_members(names);
                names.push(name);
            }
            Self::Convert { target, .. } => target.collect_members(names),
        }
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("x"),
            Self::Member { target, name } => write!(f, "{target}.{name}"),
            Self::Convert { target, to } => write!(f, "({target} as {to})"),
        }
    }
}

/// A typed property path from `T` to `P`.
pub struct PropertyPath<T, P> {
    expr: PathExpr,
    normalized: PathExpr,
    accessor: Arc<dyn Fn(&T) -> P + Send + Sync>,
    _marker: PhantomData<fn(&T) -> P>,
}

impl<T, P> PropertyPath<T, P> {
    /// Creates a path from its descriptor and accessor.
    ///
    /// The accessor must compute exactly what `expr` describes; cached
    /// pipelines built from one path are reused for every path whose
    /// normalized descriptor is equal.
    pub fn new<F>(expr: PathExpr, accessor: F) -> Self
    where
        F: Fn(&T) -> P + Send + Sync + 'static,
    {
        let normalized = expr.normalize();
        Self {
            expr,
            normalized,
            accessor: Arc::new(accessor),
            _marker: PhantomData,
        }
    }

    /// The descriptor as written.
    #[must_use]
    pub fn expr(&self) -> &PathExpr {
        &self.expr
    }

    /// The descriptor with conversions stripped.
    #[must_use]
    pub fn normalized(&self) -> &PathExpr {
        &self.normalized
    }

    /// Evaluates the path against a value.
    pub fn get(&self, value: &T) -> P {
        (self.accessor)(value)
    }

    /// Converts the property value, recording a conversion node.
    #[must_use]
    pub fn convert<Q>(self) -> PropertyPath<T, Q>
    where
        T: 'static,
        P: 'static,
        Q: From<P> + 'static,
    {
        let accessor = self.accessor;
        PropertyPath::new(
            self.expr.convert(std::any::type_name::<Q>()),
            move |value: &T| Q::from(accessor(value)),
        )
    }
}

impl<T, P> Clone for PropertyPath<T, P> {
    fn clone(&self) -> Self {
        Self {
            expr: self.expr.clone(),
            normalized: self.normalized.clone(),
            accessor: Arc::clone(&self.accessor),
            _marker: PhantomData,
        }
    }
}

impl<T, P> PartialEq for PropertyPath<T, P> {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl<T, P> Eq for PropertyPath<T, P> {}

impl<T, P> Hash for PropertyPath<T, P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl<T, P> fmt::Debug for PropertyPath<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyPath")
            .field("expr", &self.expr.to_string())
            .field("from", &std::any::type_name::<T>())
            .field("to", &std::any::type_name::<P>())
            .finish()
    }
}

/// Builds a [`PropertyPath`] from a type and a dotted member chain.
///
/// The descriptor and the accessor come from the same tokens, so they always
/// agree. The property value is cloned out of the borrowed entity.
#[macro_export]
macro_rules! property_path {
    ($ty:ty => $($field:ident).+) => {
        $crate::path::PropertyPath::<$ty, _>::new(
            $crate::path::PathExpr::root()$(.member(stringify!($field)))+,
            |value: &$ty| ::std::clone::Clone::clone(&value.$($field).+),
        )
    };
}
