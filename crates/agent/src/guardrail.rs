//! Guardrail hooks applied around every provider call, output chunk, and tool
//! execution.

use std::collections::HashSet;

use async_trait::async_trait;
use proto::{GuardrailViolation, Message, StreamChunk};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// What the agent does when [`Guardrail::can_execute_tool`] denies a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolDenialPolicy {
    /// Feed a structured tool error back to the model and keep going.
    #[default]
    Soft,
    /// End the turn with a guardrail violation.
    Hard,
}

/// Policy boundary consulted by the agent. Every hook defaults to a no-op.
#[async_trait]
pub trait Guardrail: Send + Sync {
    /// Vets (and may rewrite) the outbound message list before a provider call.
    async fn check_input(&self, messages: Vec<Message>) -> Result<Vec<Message>, GuardrailViolation> {
        Ok(messages)
    }

    /// Vets (and may rewrite) one chunk emitted by the provider.
    async fn check_output(&self, chunk: StreamChunk) -> Result<StreamChunk, GuardrailViolation> {
        Ok(chunk)
    }

    /// Decides whether a tool call may run. Must be deterministic for equal
    /// inputs.
    async fn can_execute_tool(&self, _name: &str, _arguments: &Value) -> bool {
        true
    }
}

/// Guardrail that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGuardrail;

impl Guardrail for NoopGuardrail {}

/// Configurable guardrail: input pattern blocking and token budget, output
/// redaction, and a tool denylist.
#[derive(Debug, Clone, Default)]
pub struct PolicyGuardrail {
    /// Rough budget, estimated as one token per four characters.
    pub max_input_tokens: Option<usize>,
    /// Case-insensitive substrings that reject the input outright.
    pub blocked_patterns: Vec<String>,
    pub denied_tools: HashSet<String>,
    /// Case-insensitive substrings masked in output text.
    pub redact_patterns: Vec<String>,
}

const REDACTED: &str = "[redacted]";

impl PolicyGuardrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_input_tokens(mut self, budget: usize) -> Self {
        self.max_input_tokens = Some(budget);
        self
    }

    pub fn block(mut self, pattern: impl Into<String>) -> Self {
        self.blocked_patterns.push(pattern.into());
        self
    }

    pub fn deny_tool(mut self, name: impl Into<String>) -> Self {
        self.denied_tools.insert(name.into());
        self
    }

    pub fn redact(mut self, pattern: impl Into<String>) -> Self {
        self.redact_patterns.push(pattern.into());
        self
    }

    fn estimate_tokens(messages: &[Message]) -> usize {
        let chars: usize = messages
            .iter()
            .map(|m| {
                m.text().chars().count()
                    + m.tool_calls
                        .iter()
                        .flatten()
                        .map(|c| c.arguments.chars().count())
                        .sum::<usize>()
            })
            .sum();
        chars.div_ceil(4)
    }

    fn redact_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in self.redact_patterns.iter().filter(|p| !p.is_empty()) {
            out = replace_ascii_case_insensitive(&out, pattern, REDACTED);
        }
        out
    }
}

#[async_trait]
impl Guardrail for PolicyGuardrail {
    async fn check_input(&self, messages: Vec<Message>) -> Result<Vec<Message>, GuardrailViolation> {
        if let Some(budget) = self.max_input_tokens {
            let estimated = Self::estimate_tokens(&messages);
            if estimated > budget {
                warn!(estimated, budget, "Input exceeds token budget");
                return Err(GuardrailViolation::new("input exceeds the token budget")
                    .with_detail("reason_code", "input_token_budget")
                    .with_detail("estimated_tokens", estimated)
                    .with_detail("budget", budget));
            }
        }

        for message in &messages {
            let lowered = message.text().to_ascii_lowercase();
            if let Some(pattern) = self
                .blocked_patterns
                .iter()
                .find(|p| !p.is_empty() && lowered.contains(&p.to_ascii_lowercase()))
            {
                warn!(pattern = %pattern, role = %message.role, "Input matched blocked pattern");
                return Err(GuardrailViolation::new("input contains blocked content")
                    .with_detail("reason_code", "blocked_pattern")
                    .with_detail("pattern", pattern.as_str()));
            }
        }
        Ok(messages)
    }

    async fn check_output(&self, chunk: StreamChunk) -> Result<StreamChunk, GuardrailViolation> {
        match chunk {
            StreamChunk::Delta { text } if !self.redact_patterns.is_empty() => {
                Ok(StreamChunk::Delta {
                    text: self.redact_text(&text),
                })
            }
            other => Ok(other),
        }
    }

    async fn can_execute_tool(&self, name: &str, _arguments: &Value) -> bool {
        !self.denied_tools.contains(name)
    }
}

/// Replaces every ASCII-case-insensitive occurrence of `needle`.
fn replace_ascii_case_insensitive(haystack: &str, needle: &str, replacement: &str) -> String {
    let lowered = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some(found) = lowered[cursor..].find(&needle) {
        let start = cursor + found;
        out.push_str(&haystack[cursor..start]);
        out.push_str(replacement);
        cursor = start + needle.len();
    }
    out.push_str(&haystack[cursor..]);
    out
}
