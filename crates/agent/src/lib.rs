//! Agent runtime, provider adapters, guardrails, and conversation memory.

pub mod anthropic;
pub mod gemini;
pub mod guardrail;
pub mod json_repair;
pub mod llm;
pub mod memory;
pub mod openai;
pub mod runtime;
pub mod scripted;
pub mod stream;
pub mod tool_registry;

/// Anthropic Messages API provider.
pub use anthropic::AnthropicProvider;
/// Gemini generateContent provider.
pub use gemini::GeminiProvider;
/// Guardrail hooks and the built-in policies.
pub use guardrail::{Guardrail, NoopGuardrail, PolicyGuardrail, ToolDenialPolicy};
/// Chat request and provider interfaces.
pub use llm::{ChatRequest, ChunkStream, CollectedResponse, LlmProvider, ProviderSettings};
/// Bounded per-agent conversation memory.
pub use memory::ConversationMemory;
/// OpenAI Chat Completions provider.
pub use openai::OpenAiProvider;
/// Agent turn loop.
pub use runtime::{Agent, AgentConfig, TurnFailure, TurnPhase, TurnReply};
/// Deterministic in-process provider.
pub use scripted::ScriptedProvider;
/// Runtime tool registry.
pub use tool_registry::{Registration, ToolRegistry};
