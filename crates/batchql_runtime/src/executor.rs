//! Result-tree walker.
//!
//! The executor resolves a [`QueryPlan`] against a [`ResolverMap`], creating
//! a fresh [`BatchCoordinator`] for every execution. The strategy installed
//! for the operation kind decides how sibling fields are scheduled:
//!
//! - `Serial`: the plan is walked level by level. Every resolver of a level
//!   runs to completion, one after another, before any deferred value of
//!   that level is awaited. All keys a level registers therefore land in
//!   one batch window per loader, and the first `get` flushes it.
//! - `Parallel`: each object's fields and each list element are driven
//!   concurrently. Windows flush as soon as any field awaits them.

use crate::cache::PipelineCache;
use crate::config::BatchConfig;
use crate::coordinator::BatchCoordinator;
use crate::query::{FieldNode, QueryPlan};
use crate::resolver::{FieldValue, ResolverArgs, ResolverError, ResolverInfo, ResolverMap, ResolverResult};
use crate::strategy::ExecutionStrategy;
use batchql_core::{BatchResult, ContextKey};
use futures::future::{join_all, BoxFuture};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum selection depth of a plan.
    pub max_depth: usize,
    /// Maximum concurrently resolving fields per object under the parallel
    /// strategy.
    pub max_concurrent_fields: usize,
    /// Batching configuration for the coordinators this executor creates.
    pub batch: BatchConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_depth: 15,
            max_concurrent_fields: 100,
            batch: BatchConfig::default(),
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_fields(mut self, fields: usize) -> Self {
        self.max_concurrent_fields = fields;
        self
    }

    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }
}

/// The plan executor.
///
/// Owns the pipeline cache shared by every coordinator it creates.
pub struct Executor {
    config: ExecutorConfig,
    resolvers: Arc<ResolverMap>,
    pipelines: Arc<PipelineCache>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::with_resolvers(ResolverMap::new())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("resolvers", &self.resolvers)
            .field("pipelines", &self.pipelines)
            .finish()
    }
}

impl Executor {
    /// Creates an executor with default configuration and no resolvers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor with default configuration.
    pub fn with_resolvers(resolvers: ResolverMap) -> Self {
        let config = ExecutorConfig::default();
        Self {
            pipelines: Arc::new(PipelineCache::bounded(config.batch.pipeline_cache_capacity)),
            config,
            resolvers: Arc::new(resolvers),
        }
    }

    /// Creates an executor with configuration and resolvers.
    ///
    /// # Errors
    ///
    /// Returns [`batchql_core::BatchError::InvalidArgument`] if the batch
    /// configuration is invalid.
    pub fn new_with(config: ExecutorConfig, resolvers: ResolverMap) -> BatchResult<Self> {
        config.batch.validate()?;
        Ok(Self {
            pipelines: Arc::new(PipelineCache::bounded(config.batch.pipeline_cache_capacity)),
            config,
            resolvers: Arc::new(resolvers),
        })
    }

    /// Limits and batching settings.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Registered field resolvers.
    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    /// Join pipelines shared by every execution of this executor.
    pub fn pipeline_cache(&self) -> &Arc<PipelineCache> {
        &self.pipelines
    }

    /// Executes a plan.
    pub async fn execute(&self, plan: &QueryPlan, ctx: &Context) -> Response {
        let depth = plan.depth();
        if depth > self.config.max_depth {
            return Response::error(
                FieldError::new(format!(
                    "query depth {depth} exceeds the maximum of {}",
                    self.config.max_depth
                ))
                .with_code("MAX_DEPTH_EXCEEDED"),
            );
        }

        let coordinator = match BatchCoordinator::with_pipeline_cache(
            self.config.batch.clone(),
            Arc::clone(&self.pipelines),
        ) {
            Ok(coordinator) => coordinator,
            Err(error) => return Response::error(ResolverError::from(error).into()),
        };

        let exec = ExecutionContext {
            ctx: ctx.clone().with_coordinator(Arc::new(coordinator)),
            resolvers: &self.resolvers,
            errors: Mutex::new(Vec::new()),
            max_concurrent_fields: self.config.max_concurrent_fields.max(1),
        };

        let strategy = self
            .config
            .batch
            .strategies
            .for_operation(plan.operation_kind);
        debug!(
            operation = %plan.operation_kind,
            name = plan.operation_name.as_deref().unwrap_or("<anonymous>"),
            ?strategy,
            "executing plan"
        );

        let root = Value::Object(Map::new());
        let data = match strategy {
            ExecutionStrategy::Serial => {
                let task = ObjectTask {
                    selections: &plan.fields,
                    parent: root,
                    path: Vec::new(),
                };
                exec.resolve_level(vec![task], 0)
                    .await
                    .pop()
                    .unwrap_or_default()
            }
            ExecutionStrategy::Parallel => exec.resolve_object(&plan.fields, root, Vec::new()).await,
        };

        let errors = exec.errors.into_inner();
        Response {
            data: Some(Value::Object(data)),
            errors: (!errors.is_empty()).then_some(errors),
        }
    }
}

/// One object whose selections still need resolving.
struct ObjectTask<'a> {
    selections: &'a [FieldNode],
    parent: Value,
    path: Vec<PathSegment>,
}

struct ExecutionContext<'e> {
    ctx: Context,
    resolvers: &'e ResolverMap,
    errors: Mutex<Vec<FieldError>>,
    max_concurrent_fields: usize,
}

impl ExecutionContext<'_> {
    /// Runs the field's resolver without awaiting any deferred value.
    async fn resolve_field(&self, node: &FieldNode, parent: &Value, path: &[PathSegment]) -> ResolverResult {
        let info = &node.info;
        if info.is_typename() {
            return Ok(Value::String(info.parent_type.clone()).into());
        }

        let Some(resolver) = self.resolvers.get(&info.parent_type, &info.name) else {
            return Ok(parent.get(&info.name).cloned().unwrap_or(Value::Null).into());
        };

        let args = ResolverArgs::from_pairs(info.arguments.iter().cloned());
        let resolver_info = ResolverInfo::new(&info.name, &info.parent_type)
            .with_return_type(&info.return_type)
            .with_path(path.to_vec());
        resolver.resolve(parent, &args, &self.ctx, &resolver_info).await
    }

    /// Turns a resolver outcome into a value, awaiting it if deferred.
    /// Failures are recorded and complete as null.
    async fn complete(&self, outcome: ResolverResult, path: &[PathSegment]) -> Value {
        let resolved = match outcome {
            Ok(FieldValue::Ready(value)) => Ok(value),
            Ok(FieldValue::Deferred(deferred)) => deferred
                .get(self.ctx.cancellation())
                .await
                .map_err(ResolverError::from),
            Err(error) => Err(error),
        };
        resolved.unwrap_or_else(|error| {
            debug!(path = ?path, %error, "field failed");
            self.errors
                .lock()
                .push(FieldError::from(error).with_path(path.to_vec()));
            Value::Null
        })
    }

    /// Resolves every selection of every task in two phases, then descends
    /// into all child objects of the level at once.
    fn resolve_level<'a>(
        &'a self,
        tasks: Vec<ObjectTask<'a>>,
        depth: usize,
    ) -> BoxFuture<'a, Vec<Map<String, Value>>> {
        Box::pin(async move {
            let mut collected = Vec::with_capacity(tasks.len());
            for task in &tasks {
                let mut fields = Vec::with_capacity(task.selections.len());
                for node in task.selections {
                    let path = extend(&task.path, PathSegment::Field(node.info.response_key().to_string()));
                    let outcome = self.resolve_field(node, &task.parent, &path).await;
                    fields.push((node, path, outcome));
                }
                collected.push(fields);
            }
            trace!(depth, objects = tasks.len(), "level collected");

            let mut completed = Vec::with_capacity(collected.len());
            for fields in collected {
                let mut values = Vec::with_capacity(fields.len());
                for (node, path, outcome) in fields {
                    let value = self.complete(outcome, &path).await;
                    values.push((node, path, value));
                }
                completed.push(values);
            }

            let mut next = Vec::new();
            for values in &completed {
                for &(node, ref path, ref value) in values {
                    if node.is_leaf() {
                        continue;
                    }
                    match value {
                        Value::Object(_) => next.push(ObjectTask {
                            selections: &node.children,
                            parent: value.clone(),
                            path: path.clone(),
                        }),
                        Value::Array(items) => {
                            for (index, item) in items.iter().enumerate() {
                                if item.is_object() {
                                    next.push(ObjectTask {
                                        selections: &node.children,
                                        parent: item.clone(),
                                        path: extend(path, PathSegment::Index(index)),
                                    });
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            let mut children = if next.is_empty() {
                Vec::new()
            } else {
                self.resolve_level(next, depth + 1).await
            }
            .into_iter();

            completed
                .into_iter()
                .map(|values| {
                    let mut object = Map::new();
                    for (node, _, value) in values {
                        let value = if node.is_leaf() {
                            value
                        } else {
                            merge_children(value, &mut children)
                        };
                        object.insert(node.info.response_key().to_string(), value);
                    }
                    object
                })
                .collect()
        })
    }

    /// Resolves one object's selections concurrently.
    fn resolve_object<'a>(
        &'a self,
        selections: &'a [FieldNode],
        parent: Value,
        path: Vec<PathSegment>,
    ) -> BoxFuture<'a, Map<String, Value>> {
        Box::pin(async move {
            let pending: Vec<BoxFuture<'_, (String, Value)>> = selections
                .iter()
                .map(|node| self.resolve_selection(node, &parent, &path))
                .collect();
            let fields: Vec<(String, Value)> = stream::iter(pending)
                .buffered(self.max_concurrent_fields)
                .collect()
                .await;
            fields.into_iter().collect()
        })
    }

    /// Resolves, completes and descends into one selection of an object.
    fn resolve_selection<'a>(
        &'a self,
        node: &'a FieldNode,
        parent: &'a Value,
        path: &'a [PathSegment],
    ) -> BoxFuture<'a, (String, Value)> {
        Box::pin(async move {
            let key = node.info.response_key().to_string();
            let field_path = extend(path, PathSegment::Field(key.clone()));
            let outcome = self.resolve_field(node, parent, &field_path).await;
            let value = self.complete(outcome, &field_path).await;
            let value = if node.is_leaf() {
                value
            } else {
                self.resolve_children(node, value, field_path).await
            };
            (key, value)
        })
    }

    fn resolve_children<'a>(
        &'a self,
        node: &'a FieldNode,
        value: Value,
        path: Vec<PathSegment>,
    ) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match value {
                Value::Object(_) => Value::Object(self.resolve_object(&node.children, value, path).await),
                Value::Array(items) => {
                    let elements: Vec<BoxFuture<'a, Value>> = items
                        .into_iter()
                        .enumerate()
                        .map(|(index, item)| -> BoxFuture<'a, Value> {
                            if item.is_object() {
                                let path = extend(&path, PathSegment::Index(index));
                                let object = self.resolve_object(&node.children, item, path);
                                Box::pin(async move { Value::Object(object.await) })
                            } else {
                                Box::pin(async { Value::Null })
                            }
                        })
                        .collect();
                    Value::Array(join_all(elements).await)
                }
                _ => Value::Null,
            }
        })
    }
}

fn extend(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut extended = Vec::with_capacity(path.len() + 1);
    extended.extend_from_slice(path);
    extended.push(segment);
    extended
}

/// Replaces a completed composite value with its resolved child objects,
/// consuming them in the order they were scheduled.
fn merge_children(value: Value, children: &mut impl Iterator<Item = Map<String, Value>>) -> Value {
    match value {
        Value::Object(_) => children.next().map_or(Value::Null, Value::Object),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| {
                    if item.is_object() {
                        children.next().map_or(Value::Null, Value::Object)
                    } else {
                        Value::Null
                    }
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Request context handed to resolvers.
#[derive(Debug, Clone)]
pub struct Context {
    /// Request-scoped data.
    pub data: HashMap<String, Value>,
    /// Variables from the request.
    pub variables: HashMap<String, Value>,
    coordinator: Arc<BatchCoordinator>,
    cancel: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// An empty context with its own coordinator and a live token.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            variables: HashMap::new(),
            coordinator: Arc::new(BatchCoordinator::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// An empty context carrying request variables.
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::new()
        }
    }

    /// Sets the token that cancels this request's batch fetches.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replaces the coordinator. The executor installs a fresh one per
    /// execution.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<BatchCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Loader registry for the current execution.
    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    /// Token observed by every deferred value awaited in this request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Identity of this execution, for loader lookups.
    pub fn context_key(&self) -> ContextKey {
        ContextKey::of(&self.coordinator)
    }

    /// Sets a value in the context.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
    }

    /// Gets a value from the context.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data.get(key).and_then(|v| T::deserialize(v).ok())
    }

    /// Raw value of a request variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// A request variable deserialized into `T`.
    pub fn variable_as<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        self.variables.get(name).and_then(|v| T::deserialize(v).ok())
    }
}

/// An execution response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
}

impl Response {
    /// A successful response.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    /// A response that failed before producing data.
    pub fn error(error: FieldError) -> Self {
        Self {
            data: None,
            errors: Some(vec![error]),
        }
    }

    /// Whether any field error was recorded.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Whether execution produced a data tree.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// A field error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, Value>>,
}

/// A response path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl FieldError {
    /// An error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Sets the response path of the failing field.
    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    /// Adds one extension entry.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the `code` extension.
    #[must_use]
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.with_extension("code", Value::String(code.into()))
    }

    /// The `code` extension, if set.
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

impl From<ResolverError> for FieldError {
    fn from(error: ResolverError) -> Self {
        let code = error.code();
        let mut field_error = FieldError::new(error.to_string()).with_code(code);
        if let ResolverError::Batch(batch) = &error {
            if let Some(step) = batch.step() {
                field_error = field_error.with_extension("step", Value::String(step.to_string()));
            }
        }
        field_error
    }
}
