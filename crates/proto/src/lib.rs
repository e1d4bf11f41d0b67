//! Shared protocol types for the agent runtime, tools, and step flow.
//!
//! This crate defines serializable message/chunk/tool structures, the session
//! store contract, and strongly-typed error enums shared across the workspace.

pub mod chunk;
pub mod error;
pub mod event;
pub mod message;
pub mod session;
pub mod tool;

/// Re-export of normalized streaming types.
pub use chunk::{FinishReason, SafetyAnnotation, StreamChunk, TokenUsage};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of agent progress events.
pub use event::AgentEvent;
/// Re-export of conversation/message identity types.
pub use message::{Message, Role, SessionId, ToolCallRequest};
/// Re-export of session state and store contract.
pub use session::{ReflectionEntry, ReflectionKind, SessionState, SessionStore, StepNote};
/// Re-export of tool definition and result types.
pub use tool::{ToolDefinition, ToolResult};
