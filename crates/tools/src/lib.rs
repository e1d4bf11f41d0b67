//! Tool trait, declarative parameter schemas, and built-in tool implementations.
//!
//! The agent runtime uses this crate to expose executable capabilities to the
//! model: tools describe their arguments with a [`ToolSpec`] and receive
//! validated argument maps.

pub mod function;
pub mod notes;
pub mod schema;
pub mod text;
pub mod validate;

pub use function::FnTool;
pub use notes::{ReadNotesTool, SaveNoteTool};
pub use schema::{Param, ParamKind, ToolSpec};
pub use text::count_characters_tool;
pub use validate::validate_arguments;

use std::sync::Arc;

use async_trait::async_trait;
use proto::{SessionId, SessionStore};
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure raised by a tool body. The registry wraps it into
/// [`proto::ToolError::Execution`] so it never escapes raw.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ToolFailure {
    /// Type name of the original error.
    pub kind: String,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Captures the concrete error type name alongside its message.
    pub fn from_error<E: std::fmt::Display>(err: E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }
}

/// Per-invocation context handed to tools.
#[derive(Clone, Default)]
pub struct ToolContext {
    /// Tool call id from the provider.
    pub call_id: Option<String>,
    pub session_id: Option<SessionId>,
    /// Step the calling agent is running for.
    pub step: Option<String>,
    pub store: Option<Arc<dyn SessionStore>>,
}

impl ToolContext {
    pub fn for_session(session_id: SessionId, step: impl Into<String>) -> Self {
        Self {
            call_id: None,
            session_id: Some(session_id),
            step: Some(step.into()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("call_id", &self.call_id)
            .field("session_id", &self.session_id)
            .field("step", &self.step)
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declared name, description, and parameters.
    fn spec(&self) -> &ToolSpec;

    /// Unique tool name exposed to the LLM.
    fn name(&self) -> &str {
        &self.spec().name
    }

    /// JSON schema for accepted tool arguments.
    fn parameters_schema(&self) -> Value {
        self.spec().parameters_schema()
    }

    /// Executes the tool with already-validated arguments.
    async fn execute(&self, ctx: &ToolContext, args: Map<String, Value>)
    -> Result<Value, ToolFailure>;
}
