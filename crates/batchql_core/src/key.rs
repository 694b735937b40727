//! Join-key classification and execution-context keys.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// How a join property is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JoinKeyKind {
    /// String keys (possibly absent).
    String,
    /// Non-nullable scalar keys (integers, chars, bools, enums...).
    Value,
    /// Nullable scalar keys.
    NullableValue,
}

/// A property type usable on either side of a query-join.
///
/// `Inner` is the underlying non-null key. Parent and child properties join
/// when they share the same `Inner` type; `into_inner` returning `None`
/// means the entity has no key and never participates in a fetch.
pub trait JoinKey: Clone + Send + Sync + 'static {
    /// The non-null key both sides are compared on.
    type Inner: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;

    /// Classification of this property type.
    const KIND: JoinKeyKind;

    /// Unwraps the key, returning `None` for null.
    fn into_inner(self) -> Option<Self::Inner>;
}

/// Marker for non-nullable scalar join keys.
///
/// Implemented for the primitive integer types, `bool` and `char`. Domain
/// id newtypes and fieldless enums opt in with [`value_join_key!`].
pub trait ValueKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: ValueKey> JoinKey for T {
    type Inner = T;
    const KIND: JoinKeyKind = JoinKeyKind::Value;

    fn into_inner(self) -> Option<T> {
        Some(self)
    }
}

impl<T: ValueKey> JoinKey for Option<T> {
    type Inner = T;
    const KIND: JoinKeyKind = JoinKeyKind::NullableValue;

    fn into_inner(self) -> Option<T> {
        self
    }
}

impl JoinKey for String {
    type Inner = String;
    const KIND: JoinKeyKind = JoinKeyKind::String;

    fn into_inner(self) -> Option<String> {
        Some(self)
    }
}

impl JoinKey for Option<String> {
    type Inner = String;
    const KIND: JoinKeyKind = JoinKeyKind::String;

    fn into_inner(self) -> Option<String> {
        self
    }
}

/// Implements [`ValueKey`] for domain key types.
#[macro_export]
macro_rules! value_join_key {
    ($($ty:ty),+ $(,)?) => {
        $(impl $crate::key::ValueKey for $ty {})+
    };
}

value_join_key!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char);

/// Caller-chosen identity of a function value.
///
/// A function's type does not tell its instances apart: a factory returning
/// `impl Fn` yields one type whatever it captured. Fetch functions and join
/// transforms are therefore identified by a key their caller picks, and two
/// functions of one type under one key are treated as the same function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FnKey(Arc<str>);

impl FnKey {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FnKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for FnKey {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for FnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the execution context a loader belongs to.
///
/// The context itself is opaque to batchql; only its identity takes part in
/// cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Identity of a shared allocation.
    Ptr(usize),
    /// A named context.
    Named(Arc<str>),
    /// A numeric context id.
    Id(u64),
}

impl ContextKey {
    /// Identifies a context by the address of its shared allocation.
    ///
    /// Only meaningful while `context` is alive.
    #[must_use]
    pub fn of<T: ?Sized>(context: &Arc<T>) -> Self {
        Self::Ptr(Arc::as_ptr(context).cast::<()>() as usize)
    }

    /// A named context.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self::Named(Arc::from(name))
    }
}

impl From<&str> for ContextKey {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<u64> for ContextKey {
    fn from(id: u64) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ptr(addr) => write!(f, "ctx@{addr:#x}"),
            Self::Named(name) => write!(f, "ctx:{name}"),
            Self::Id(id) => write!(f, "ctx#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct UserId(u32);

    value_join_key!(UserId);

    fn kind_of<K: JoinKey>() -> JoinKeyKind {
        K::KIND
    }

    #[test]
    fn test_classification() {
        assert_eq!(kind_of::<i64>(), JoinKeyKind::Value);
        assert_eq!(kind_of::<Option<i64>>(), JoinKeyKind::NullableValue);
        assert_eq!(kind_of::<String>(), JoinKeyKind::String);
        assert_eq!(kind_of::<Option<String>>(), JoinKeyKind::String);
        assert_eq!(kind_of::<UserId>(), JoinKeyKind::Value);
        assert_eq!(kind_of::<Option<UserId>>(), JoinKeyKind::NullableValue);
    }

    #[test]
    fn test_into_inner() {
        assert_eq!(5_i32.into_inner(), Some(5));
        assert_eq!(Some(5_i32).into_inner(), Some(5));
        assert_eq!(None::<i32>.into_inner(), None);
        assert_eq!(None::<String>.into_inner(), None);
        assert_eq!(UserId(1).into_inner(), Some(UserId(1)));
    }

    #[test]
    fn test_context_key_identity() {
        let a = Arc::new(String::from("request"));
        let b = Arc::new(String::from("request"));

        assert_eq!(ContextKey::of(&a), ContextKey::of(&Arc::clone(&a)));
        assert_ne!(ContextKey::of(&a), ContextKey::of(&b));
        assert_eq!(ContextKey::from("tenant-a"), ContextKey::named("tenant-a"));
        assert_eq!(ContextKey::from(7_u64).to_string(), "ctx#7");
    }

    #[test]
    fn test_fn_key() {
        assert_eq!(FnKey::from("Post.author"), FnKey::from("Post.author".to_string()));
        assert_ne!(FnKey::new("Post.author"), FnKey::new("Post.editor"));
        assert_eq!(FnKey::new("x").to_string(), "x");
    }
}
