//! LLM provider abstraction and the normalized chunk stream every adapter returns.

use std::time::Duration;

use async_trait::async_trait;
use proto::{
    FinishReason, LlmError, Message, SafetyAnnotation, StreamChunk, TokenUsage, ToolCallRequest,
    ToolDefinition,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the channel between an adapter pump task and its consumer.
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Request to the LLM
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Full chat history including system/user/assistant/tool messages.
    pub messages: Vec<Message>,
    /// Available tools schema.
    pub tools: Vec<ToolDefinition>,
    /// Target model id.
    pub model: String,
    /// Ask the vendor for an incremental stream instead of one response.
    pub stream: bool,
}

/// Transport settings shared by the HTTP adapters.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: String,
    pub base_url: Option<String>,
    /// Budget for the initial request and for each idle gap between chunks.
    pub timeout: Duration,
    pub max_output_tokens: u32,
}

impl ProviderSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            timeout: Duration::from_secs(120),
            max_output_tokens: 8192,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// LLM provider trait
///
/// Adapters never surface transport failures or timeouts as `Err`: those
/// arrive as an `error` chunk on the returned stream. `Err` is reserved for
/// requests that could not be built at all.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short vendor tag used in logs.
    fn name(&self) -> &str;

    /// Sends a chat request and returns its normalized chunk stream.
    async fn send(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, LlmError>;
}

/// Ordered stream of normalized chunks for one provider round.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<StreamChunk>,
}

impl ChunkStream {
    /// Creates a bounded channel whose receiving half is the stream.
    pub fn channel() -> (mpsc::Sender<StreamChunk>, Self) {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        (tx, Self { rx })
    }

    pub fn from_receiver(rx: mpsc::Receiver<StreamChunk>) -> Self {
        Self { rx }
    }

    /// A finished stream holding exactly `chunks`.
    pub fn from_chunks(chunks: Vec<StreamChunk>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // Capacity covers every chunk.
            let _ = tx.try_send(chunk);
        }
        Self { rx }
    }

    /// A stream that only reports `err`.
    pub fn failed(err: &LlmError) -> Self {
        Self::from_chunks(vec![StreamChunk::from(err)])
    }

    pub async fn next(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }

    /// Drains the stream into one aggregated response.
    pub async fn collect(mut self) -> CollectedResponse {
        let mut collected = CollectedResponse::default();
        while let Some(chunk) = self.next().await {
            collected.absorb(chunk);
        }
        collected
    }
}

/// Aggregated view of a whole chunk stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    pub safety: Vec<SafetyAnnotation>,
    /// First `(code, message)` error seen.
    pub error: Option<(String, String)>,
}

impl CollectedResponse {
    fn absorb(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Delta { text } => self.text.push_str(&text),
            StreamChunk::ToolCallStart { .. } | StreamChunk::ToolCallDelta { .. } => {}
            StreamChunk::ToolCallEnd {
                id,
                name,
                arguments,
            } => self
                .tool_calls
                .push(ToolCallRequest::new(id, name, arguments)),
            StreamChunk::Meta {
                finish_reason,
                safety,
            } => {
                if finish_reason.is_some() {
                    self.finish_reason = finish_reason;
                }
                self.safety.extend(safety);
            }
            StreamChunk::Usage(usage) => match self.usage.as_mut() {
                Some(total) => total.add(&usage),
                None => self.usage = Some(usage),
            },
            StreamChunk::Error { code, message } => {
                if self.error.is_none() {
                    self.error = Some((code, message));
                }
            }
        }
    }
}
