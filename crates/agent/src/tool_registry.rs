//! Tool registry used by the runtime to list, validate, and execute tools.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use proto::{ToolDefinition, ToolError, ToolResult};
use serde_json::{Map, Value};
use tools::{Tool, ToolContext, validate_arguments};
use tracing::{debug, warn};

/// Outcome of [`ToolRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    /// An earlier tool with the same name was overwritten.
    Replaced,
}

struct Entry {
    tool: Arc<dyn Tool>,
    schema: Value,
}

/// Registry of available tools
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
    /// Registration order, used for stable schema listings.
    order: Vec<String>,
}

impl ToolRegistry {
    /// Creates an empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a tool, deriving its schema from the declared parameters.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Registration {
        let schema = tool.parameters_schema();
        self.insert(Arc::new(tool), schema)
    }

    /// Register a tool with an explicit parameters schema. Validation still
    /// follows the tool's declared parameter list.
    pub fn register_with_schema(&mut self, tool: impl Tool + 'static, schema: Value) -> Registration {
        self.insert(Arc::new(tool), schema)
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Registration {
        let schema = tool.parameters_schema();
        self.insert(tool, schema)
    }

    fn insert(&mut self, tool: Arc<dyn Tool>, schema: Value) -> Registration {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), Entry { tool, schema });
        if previous.is_some() {
            warn!(tool = %name, "Tool already registered, overwriting");
            Registration::Replaced
        } else {
            debug!(tool = %name, "Registering tool");
            self.order.push(name);
            Registration::Inserted
        }
    }

    /// Get tool definitions for the LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|entry| {
                let spec = entry.tool.spec();
                ToolDefinition::new(&spec.name, &spec.description, entry.schema.clone())
            })
            .collect()
    }

    /// Tool definitions in vendor tool-calling wire format.
    pub fn schemas(&self) -> Vec<Value> {
        self.definitions().iter().map(ToolDefinition::to_wire).collect()
    }

    /// Returns the list of registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Decodes and validates raw argument JSON for `name`.
    ///
    /// An empty string is treated as `{}`. Scalars are coerced where the
    /// declared kind allows it.
    pub fn parse_arguments(&self, name: &str, raw: &str) -> Result<Map<String, Value>, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let value = if raw.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str::<Value>(raw).map_err(|e| ToolError::Parameter {
                tool: name.to_string(),
                message: format!("arguments are not valid JSON: {e}"),
            })?
        };

        validate_arguments(&entry.tool.spec().params, value).map_err(|message| {
            ToolError::Parameter {
                tool: name.to_string(),
                message,
            }
        })
    }

    /// Execute a tool with validated arguments and a default context.
    pub async fn execute(&self, name: &str, args: Map<String, Value>) -> Result<Value, ToolError> {
        self.execute_in(&ToolContext::default(), name, args).await
    }

    /// Execute a tool with validated arguments. Failures and panics inside
    /// the tool body come back as [`ToolError::Execution`].
    pub async fn execute_in(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        debug!(tool = %name, call_id = ?ctx.call_id, "Executing tool");
        match AssertUnwindSafe(entry.tool.execute(ctx, args))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(ToolError::Execution {
                tool: name.to_string(),
                kind: failure.kind,
                message: failure.message,
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                Err(ToolError::Execution {
                    tool: name.to_string(),
                    kind: "panic".to_string(),
                    message,
                })
            }
        }
    }

    /// Full parse → execute pipeline for one model-issued call. Never fails:
    /// errors become a structured `{"error": ...}` result.
    pub async fn invoke(&self, ctx: &ToolContext, call_id: &str, name: &str, raw: &str) -> ToolResult {
        let outcome = match self.parse_arguments(name, raw) {
            Ok(args) => self.execute_in(ctx, name, args).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(output) => ToolResult::success(call_id, name, output),
            Err(err) => {
                warn!(tool = %name, call_id, code = err.code(), error = %err, "Tool call failed");
                ToolResult::error(call_id, name, &err.payload())
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
