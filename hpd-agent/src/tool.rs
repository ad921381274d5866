//! Tool descriptors, handlers, and the registry capability.
//!
//! The core resolves function names through a narrow [`ToolRegistry`]
//! interface. Descriptors are built at registration time; there is no
//! runtime probing.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// Descriptor for one callable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Function name (snake_case).
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON schema of the parameter object.
    pub parameters: Value,
    /// Whether invocation requires an interactive permission check.
    #[serde(default)]
    pub requires_permission: bool,
    /// Scope this tool belongs to. Scoped tools enter the model catalog
    /// only while their scope is expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Scope that a successful invocation of this tool expands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expands_scope: Option<String>,
}

impl ToolDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_permission: false,
            scope: None,
            expands_scope: None,
        }
    }

    /// Mark the function as requiring permission.
    #[must_use]
    pub const fn with_permission_required(mut self) -> Self {
        self.requires_permission = true;
        self
    }

    /// Place the function in a scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Declare the scope this function expands when invoked.
    #[must_use]
    pub fn with_expands_scope(mut self, scope: impl Into<String>) -> Self {
        self.expands_scope = Some(scope.into());
        self
    }
}

/// Generate the parameter schema for a type deriving [`JsonSchema`].
///
/// The `$schema` meta field is stripped; model APIs don't need it.
#[must_use]
pub fn schema_for<T: JsonSchema>() -> Value {
    let root = schemars::schema_for!(T);
    let mut value = serde_json::to_value(&root).unwrap_or_default();
    if let Value::Object(ref mut map) = value {
        map.remove("$schema");
    }
    value
}

/// Object-safe invocation interface for a registered tool.
///
/// Implementations may be blocking or I/O-bound; the dispatcher runs
/// them under the per-call timeout and passes the run's cancellation
/// token, which tools may honor or ignore.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Invoke the tool with JSON arguments.
    async fn invoke(&self, arguments: Value, cancel: &CancellationToken)
    -> Result<Value, ToolError>;
}

/// Typed tool interface with derived schema and argument parsing.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Arguments type for the tool.
    type Args: for<'de> Deserialize<'de> + JsonSchema + Send;

    /// Output type of the tool.
    type Output: Serialize + Send;

    /// Description shown to the model.
    fn description(&self) -> String;

    /// Whether invocation requires an interactive permission check.
    fn requires_permission(&self) -> bool {
        false
    }

    /// Execute the tool.
    async fn call(&self, args: Self::Args) -> Result<Self::Output, ToolError>;

    /// Build the descriptor for this tool.
    fn descriptor(&self) -> ToolDescriptor {
        let mut descriptor =
            ToolDescriptor::new(Self::NAME, self.description(), schema_for::<Self::Args>());
        descriptor.requires_permission = self.requires_permission();
        descriptor
    }
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    async fn invoke(
        &self,
        arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        // Providers sometimes deliver the argument map as a JSON string.
        let args: T::Args = match &arguments {
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?,
            other => serde_json::from_value(other.clone())
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?,
        };
        let output = self.call(args).await?;
        serde_json::to_value(output).map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// A descriptor paired with its handler.
#[derive(Clone)]
pub struct RegisteredTool {
    /// The function descriptor.
    pub descriptor: ToolDescriptor,
    /// The invocation handler.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// The registry capability consumed by the dispatcher. Resolution is O(1).
pub trait ToolRegistry: Send + Sync {
    /// Resolve a function by name.
    fn resolve(&self, name: &str) -> Option<RegisteredTool>;

    /// All registered descriptors, in registration order.
    fn descriptors(&self) -> Vec<ToolDescriptor>;
}

/// Map-backed registry built once at construction time.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed tool.
    #[must_use]
    pub fn with_tool<T: Tool + 'static>(self, tool: T) -> Self {
        let descriptor = tool.descriptor();
        self.with_handler(descriptor, Arc::new(tool))
    }

    /// Register a descriptor with an explicit handler.
    #[must_use]
    pub fn with_handler(mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) -> Self {
        let name = descriptor.name.clone();
        self.tools
            .insert(name.clone(), RegisteredTool { descriptor, handler });
        self.order.push(name);
        self
    }

    /// Number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no functions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolRegistry for StaticRegistry {
    fn resolve(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.get(name).cloned()
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.descriptor.clone())
            .collect()
    }
}

/// Closure-backed handler for tools defined inline.
pub struct FunctionTool<F> {
    f: F,
}

impl<F, Fut> FunctionTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ToolError>> + Send,
{
    /// Wrap an async closure as a handler.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FunctionTool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FunctionTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ToolError>> + Send,
{
    async fn invoke(
        &self,
        arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        (self.f)(arguments).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    struct AddTool;

    #[async_trait]
    impl Tool for AddTool {
        const NAME: &'static str = "add";
        type Args = AddArgs;
        type Output = i64;

        fn description(&self) -> String {
            "Add two integers".into()
        }

        async fn call(&self, args: Self::Args) -> Result<Self::Output, ToolError> {
            Ok(args.a + args.b)
        }
    }

    #[tokio::test]
    async fn typed_tool_invokes_through_handler() {
        let registry = StaticRegistry::new().with_tool(AddTool);
        let tool = registry.resolve("add").unwrap();
        let cancel = CancellationToken::new();
        let out = tool.handler.invoke(json!({"a": 2, "b": 3}), &cancel).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn typed_tool_accepts_string_arguments() {
        let cancel = CancellationToken::new();
        let out = AddTool
            .invoke(Value::String("{\"a\":1,\"b\":1}".into()), &cancel)
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported() {
        let cancel = CancellationToken::new();
        let err = AddTool.invoke(json!({"a": "x"}), &cancel).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn descriptor_carries_schema() {
        let descriptor = AddTool.descriptor();
        assert_eq!(descriptor.name, "add");
        let props = descriptor.parameters.get("properties").unwrap();
        assert!(props.get("a").is_some());
        assert!(props.get("b").is_some());
    }

    #[test]
    fn registry_preserves_registration_order() {
        let registry = StaticRegistry::new()
            .with_handler(
                ToolDescriptor::new("b_tool", "", json!({})),
                Arc::new(FunctionTool::new(|_| async { Ok::<_, ToolError>(json!(null)) })),
            )
            .with_handler(
                ToolDescriptor::new("a_tool", "", json!({})),
                Arc::new(FunctionTool::new(|_| async { Ok::<_, ToolError>(json!(null)) })),
            );
        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b_tool", "a_tool"]);
    }

    #[test]
    fn resolve_missing_returns_none() {
        let registry = StaticRegistry::new();
        assert!(registry.resolve("nope").is_none());
        assert!(registry.is_empty());
    }
}
