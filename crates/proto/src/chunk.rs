//! Normalized streaming vocabulary shared by every provider adapter.

use serde::{Deserialize, Serialize};

/// Closed set of terminal reasons. Vendor-specific strings are mapped onto
/// these by the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Safety,
    StreamEnd,
    Error,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::Safety => "safety",
            Self::StreamEnd => "stream_end",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Safety rating attached to a `meta` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyAnnotation {
    pub category: String,
    pub probability: String,
    #[serde(default)]
    pub blocked: bool,
}

/// Token usage reported by the LLM for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt / input.
    pub prompt_tokens: u32,
    /// Number of tokens in the generated output.
    pub completion_tokens: u32,
    /// Total as reported by the vendor (or the sum when absent).
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Accumulates another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One unit of normalized streaming output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Incremental assistant text.
    Delta { text: String },
    /// A tool call was opened. `arguments` holds whatever argument text was
    /// known when the call was first seen (complete for non-streaming vendors).
    ToolCallStart {
        id: String,
        name: String,
        arguments: String,
    },
    /// A partial argument fragment for an open call.
    ToolCallDelta { id: String, fragment: String },
    /// The call is closed; `arguments` is always well-formed JSON.
    ToolCallEnd {
        id: String,
        name: String,
        arguments: String,
    },
    /// Terminal reason and safety annotations.
    Meta {
        finish_reason: Option<FinishReason>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        safety: Vec<SafetyAnnotation>,
    },
    /// Token accounting, never folded into text.
    Usage(TokenUsage),
    /// Vendor-agnostic failure.
    Error { code: String, message: String },
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self::Meta {
            finish_reason: Some(reason),
            safety: Vec::new(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::Meta { .. } => "meta",
            Self::Usage(_) => "usage",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl From<&crate::LlmError> for StreamChunk {
    fn from(err: &crate::LlmError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}
