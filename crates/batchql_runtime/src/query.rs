//! Query plans walked by the executor.

use crate::strategy::OperationKind;
use serde_json::Value;

/// Static information about one selected field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Alias, if any.
    pub alias: Option<String>,
    /// Type that declares the field.
    pub parent_type: String,
    /// Named return type.
    pub return_type: String,
    /// Argument values.
    pub arguments: Vec<(String, Value)>,
}

impl FieldInfo {
    /// Creates field info for `parent_type.name`.
    pub fn new(parent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            parent_type: parent_type.into(),
            return_type: String::new(),
            arguments: Vec::new(),
        }
    }

    /// The key the field is written under in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Returns true for `__typename`.
    pub fn is_typename(&self) -> bool {
        self.name == "__typename"
    }
}

/// A selected field and its sub-selections.
#[derive(Debug, Clone)]
pub struct FieldNode {
    pub info: FieldInfo,
    /// Empty for leaf fields.
    pub children: Vec<FieldNode>,
}

impl FieldNode {
    /// A leaf field.
    pub fn leaf(parent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            info: FieldInfo::new(parent_type, name),
            children: Vec::new(),
        }
    }

    /// A field of object type with the given sub-selections.
    pub fn object(
        parent_type: impl Into<String>,
        name: impl Into<String>,
        return_type: impl Into<String>,
        children: Vec<FieldNode>,
    ) -> Self {
        let mut info = FieldInfo::new(parent_type, name);
        info.return_type = return_type.into();
        Self { info, children }
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.info.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.info.arguments.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.info.return_type = ty.into();
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth of this field's subtree, counting the field itself.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(FieldNode::depth).max().unwrap_or(0)
    }
}

/// A plan for one operation.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub operation_kind: OperationKind,
    pub operation_name: Option<String>,
    /// Root selections.
    pub fields: Vec<FieldNode>,
}

impl QueryPlan {
    /// A plan for a query operation.
    pub fn query(fields: Vec<FieldNode>) -> Self {
        Self::new(OperationKind::Query, fields)
    }

    /// A plan for a mutation operation.
    pub fn mutation(fields: Vec<FieldNode>) -> Self {
        Self::new(OperationKind::Mutation, fields)
    }

    pub fn new(operation_kind: OperationKind, fields: Vec<FieldNode>) -> Self {
        Self {
            operation_kind,
            operation_name: None,
            fields,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Depth of the deepest selection.
    pub fn depth(&self) -> usize {
        self.fields.iter().map(FieldNode::depth).max().unwrap_or(0)
    }

    /// Name of the root type for the operation kind.
    pub fn root_type(&self) -> &'static str {
        match self.operation_kind {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}
