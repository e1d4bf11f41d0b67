use serde_json::Value;

use crate::chunk::TokenUsage;

/// Provider-agnostic progress events re-emitted by an agent turn.
///
/// These events are sent via `tokio::sync::mpsc` so that consumers (CLI,
/// orchestrator callers) can display live status while the tool loop runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The provider is being consulted (round N of the tool loop).
    ProviderRound { agent: String, round: usize },
    /// Incremental assistant text that passed the output guardrail.
    TextDelta { agent: String, text: String },
    /// A tool call has been dispatched but has not yet completed.
    ToolCallStarted {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    /// A tool call has finished executing (or was denied).
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: Value,
        is_error: bool,
    },
    /// Token usage reported for one provider round.
    Usage { agent: String, usage: TokenUsage },
}
