//! Field resolvers.
//!
//! A resolver produces either a value right away or a [`Deferred`] value
//! registered with a batch loader. The executor collects deferred values and
//! only awaits them once every resolver of the current level has run.

use crate::deferred::Deferred;
use crate::executor::{Context, PathSegment};
use batchql_core::BatchError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Arguments passed to a resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverArgs {
    args: HashMap<String, Value>,
}

impl ResolverArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from (name, value) pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| T::deserialize(v).ok())
    }

    /// Gets a required argument.
    ///
    /// # Errors
    ///
    /// Fails if the argument is missing or does not deserialize to `T`.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ResolverError> {
        let value = self
            .args
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_string()))?;
        T::deserialize(value)
            .map_err(|e| ResolverError::ArgumentParse(name.to_string(), e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    pub field_name: String,
    pub parent_type: String,
    pub return_type: String,
    /// Response path of this field.
    pub path: Vec<PathSegment>,
}

impl ResolverInfo {
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            parent_type: parent_type.into(),
            return_type: String::new(),
            path: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    /// A label for loaders registered by this field, e.g. `Post.author`.
    pub fn step_name(&self) -> String {
        format!("{}.{}", self.parent_type, self.field_name)
    }
}

/// What a resolver hands back to the executor.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// A value available now.
    Ready(Value),
    /// A value produced when its batch window flushes.
    Deferred(Deferred<Value>),
}

impl FieldValue {
    pub fn null() -> Self {
        Self::Ready(Value::Null)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Ready(value)
    }
}

impl From<Deferred<Value>> for FieldValue {
    fn from(deferred: Deferred<Value>) -> Self {
        Self::Deferred(deferred)
    }
}

/// Result type for resolvers.
pub type ResolverResult = Result<FieldValue, ResolverError>;

/// Future type for async resolvers.
pub type ResolverFuture<'a> = Pin<Box<dyn Future<Output = ResolverResult> + Send + 'a>>;

/// Error from a resolver.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParse(String, String),

    /// A loader could not be obtained or a deferred value failed.
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("{0}")]
    Custom(String),
}

impl ResolverError {
    /// Machine-readable code reported in the error extensions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FieldNotFound(_) => "FIELD_NOT_FOUND",
            Self::MissingArgument(_) | Self::ArgumentParse(..) => "BAD_ARGUMENT",
            Self::Batch(BatchError::Cancelled { .. }) => "CANCELLED",
            Self::Batch(BatchError::Fetch { .. }) => "BATCH_FETCH_FAILED",
            Self::Batch(_) => "BATCH_MISUSE",
            Self::Custom(_) => "RESOLVER_ERROR",
        }
    }
}

/// Trait for field resolvers.
pub trait Resolver: Send + Sync {
    /// Resolves a field value.
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;
}

type BoxedResolver = Box<dyn Resolver>;

type SyncResolverFn =
    dyn Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync;

/// Resolver backed by a synchronous function.
///
/// Most batched fields are written this way: the function registers a key
/// with a loader and returns the deferred value without awaiting it.
pub struct FnResolver {
    func: Arc<SyncResolverFn>,
}

impl FnResolver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Resolver for FnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = (self.func)(parent, args, ctx, info);
        Box::pin(async move { result })
    }
}

type AsyncResolverFn =
    dyn Fn(Value, ResolverArgs, Context, ResolverInfo) -> ResolverFuture<'static> + Send + Sync;

/// Resolver backed by an async function.
pub struct AsyncFnResolver {
    func: Arc<AsyncResolverFn>,
}

impl AsyncFnResolver {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        Self {
            func: Arc::new(
                move |parent: Value,
                      args: ResolverArgs,
                      ctx: Context,
                      info: ResolverInfo|
                      -> ResolverFuture<'static> { Box::pin(f(parent, args, ctx, info)) },
            ),
        }
    }
}

impl Resolver for AsyncFnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        (self.func)(parent.clone(), args.clone(), ctx.clone(), info.clone())
    }
}

/// Reads the field from the parent object, trying the snake_case spelling
/// when the exact name is absent.
pub struct PropertyResolver;

impl Resolver for PropertyResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        _args: &'a ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = match parent {
            Value::Object(map) => Ok(map
                .get(&info.field_name)
                .or_else(|| map.get(&to_snake_case(&info.field_name)))
                .cloned()
                .unwrap_or(Value::Null)
                .into()),
            Value::Null => Ok(FieldValue::null()),
            _ => Err(ResolverError::FieldNotFound(info.step_name())),
        };
        Box::pin(async move { result })
    }
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Resolvers indexed by `Type.field`.
pub struct ResolverMap {
    resolvers: HashMap<String, BoxedResolver>,
    fallback: Option<BoxedResolver>,
}

impl Default for ResolverMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverMap {
    /// Creates a map that falls back to [`PropertyResolver`].
    pub fn new() -> Self {
        Self {
            resolvers: HashMap::new(),
            fallback: Some(Box::new(PropertyResolver)),
        }
    }

    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_name: impl AsRef<str>,
        field_name: impl AsRef<str>,
        resolver: R,
    ) {
        let key = format!("{}.{}", type_name.as_ref(), field_name.as_ref());
        self.resolvers.insert(key, Box::new(resolver));
    }

    /// Registers a synchronous function.
    pub fn register_fn<F>(&mut self, type_name: impl AsRef<str>, field_name: impl AsRef<str>, f: F)
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, field_name, FnResolver::new(f));
    }

    /// Registers an async function.
    pub fn register_async<F, Fut>(
        &mut self,
        type_name: impl AsRef<str>,
        field_name: impl AsRef<str>,
        f: F,
    ) where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.register(type_name, field_name, AsyncFnResolver::new(f));
    }

    /// Gets the resolver for a field, or the fallback.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&dyn Resolver> {
        self.resolvers
            .get(&format!("{type_name}.{field_name}"))
            .or(self.fallback.as_ref())
            .map(|r| r.as_ref())
    }

    pub fn set_fallback<R: Resolver + 'static>(&mut self, resolver: R) {
        self.fallback = Some(Box::new(resolver));
    }

    pub fn remove_fallback(&mut self) {
        self.fallback = None;
    }
}

impl fmt::Debug for ResolverMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    async fn ready(result: ResolverResult) -> Value {
        match result.unwrap() {
            FieldValue::Ready(value) => value,
            FieldValue::Deferred(deferred) => deferred.get(&CancellationToken::new()).await.unwrap(),
        }
    }

    #[test]
    fn test_resolver_args() {
        let mut args = ResolverArgs::new();
        args.set("id", json!(123));
        args.set("name", json!("test"));

        assert_eq!(args.get_as::<i64>("id"), Some(123));
        assert_eq!(args.get_as::<String>("name"), Some("test".to_string()));
        assert_eq!(args.get_as::<i64>("missing"), None);
        assert!(matches!(
            args.require::<i64>("name"),
            Err(ResolverError::ArgumentParse(..))
        ));
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("firstName"), "first_name");
        assert_eq!(to_snake_case("authorId"), "author_id");
        assert_eq!(to_snake_case("id"), "id");
    }

    #[tokio::test]
    async fn test_property_resolver() {
        let parent = json!({"author_id": 7, "title": "Hello"});
        let args = ResolverArgs::new();
        let ctx = Context::new();

        let info = ResolverInfo::new("authorId", "Post");
        let value = ready(PropertyResolver.resolve(&parent, &args, &ctx, &info).await).await;
        assert_eq!(value, json!(7));

        let info = ResolverInfo::new("title", "Post");
        let value = ready(PropertyResolver.resolve(&parent, &args, &ctx, &info).await).await;
        assert_eq!(value, json!("Hello"));
    }

    #[tokio::test]
    async fn test_fn_resolver_can_defer() {
        let resolver = FnResolver::new(|_parent, args, _ctx, _info| {
            let id: i64 = args.require("id")?;
            Ok(Deferred::ready(json!({ "id": id })).into())
        });

        let mut args = ResolverArgs::new();
        args.set("id", json!(42));
        let ctx = Context::new();
        let info = ResolverInfo::new("user", "Query");

        let result = resolver.resolve(&json!({}), &args, &ctx, &info).await;
        assert!(result.as_ref().unwrap().is_deferred());
        assert_eq!(ready(result).await, json!({"id": 42}));
    }

    #[tokio::test]
    async fn test_resolver_map_fallback() {
        let mut map = ResolverMap::new();
        map.register_async("Query", "hello", |_parent, _args, _ctx, _info| async {
            Ok::<_, ResolverError>(FieldValue::from(json!("world")))
        });

        let ctx = Context::new();
        let args = ResolverArgs::new();

        let hello = map.get("Query", "hello").unwrap();
        let info = ResolverInfo::new("hello", "Query");
        assert_eq!(ready(hello.resolve(&json!({}), &args, &ctx, &info).await).await, json!("world"));

        let name = map.get("User", "name").unwrap();
        let info = ResolverInfo::new("name", "User");
        assert_eq!(
            ready(name.resolve(&json!({"name": "Bob"}), &args, &ctx, &info).await).await,
            json!("Bob")
        );

        map.remove_fallback();
        assert!(map.get("User", "name").is_none());
    }

    #[test]
    fn test_error_codes() {
        let cancelled = ResolverError::from(BatchError::cancelled("Post.author"));
        assert_eq!(cancelled.code(), "CANCELLED");
        assert_eq!(cancelled.to_string(), "batch fetch `Post.author` was cancelled");
        assert_eq!(ResolverError::MissingArgument("id".into()).code(), "BAD_ARGUMENT");
    }
}
