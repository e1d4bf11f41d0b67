use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorPayload;

/// Tool schema advertised to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Description used by the model for tool selection.
    pub description: String,
    /// JSON-Schema object describing the arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Vendor tool-calling wire format:
    /// `{"type":"function","function":{"name","description","parameters"}}`.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Normalized outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool call id this result answers.
    pub call_id: String,
    /// Name of the tool.
    pub tool_name: String,
    /// Flattened output (or the `{"error": ...}` object).
    pub output: Value,
    /// Whether `output` describes a failure.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, tool_name: impl Into<String>, output: Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output,
            is_error: false,
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: &ErrorPayload,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: error.to_tool_output(),
            is_error: true,
        }
    }

    /// Serialized content for the tool-result message.
    pub fn content(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
