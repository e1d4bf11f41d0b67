//! Shared streaming machinery for the provider adapters: the per-turn tool
//! call accumulator and the task that pumps vendor events into a
//! [`ChunkStream`].

use std::collections::BTreeMap;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use proto::{FinishReason, LlmError, StreamChunk, TokenUsage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::json_repair::repair_json;
use crate::llm::ChunkStream;

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Open tool calls of one provider round, keyed by the vendor's position
/// index. A fresh accumulator is created for every round.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: BTreeMap<usize, PendingCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Opens a slot and returns its `tool_call_start` chunk.
    pub fn start(&mut self, index: usize, id: impl Into<String>, name: impl Into<String>) -> StreamChunk {
        let id = id.into();
        let name = name.into();
        if let Some(previous) = self.slots.get(&index) {
            warn!(index, previous = %previous.id, "Tool call slot reopened before close");
        }
        self.slots.insert(
            index,
            PendingCall {
                id: id.clone(),
                name: name.clone(),
                arguments: String::new(),
            },
        );
        StreamChunk::ToolCallStart {
            id,
            name,
            arguments: String::new(),
        }
    }

    /// Appends an argument fragment. Returns `None` for an unknown index or
    /// an empty fragment.
    pub fn push(&mut self, index: usize, fragment: &str) -> Option<StreamChunk> {
        if fragment.is_empty() {
            return None;
        }
        let Some(slot) = self.slots.get_mut(&index) else {
            debug!(index, "Dropping argument fragment for unopened tool call");
            return None;
        };
        slot.arguments.push_str(fragment);
        Some(StreamChunk::ToolCallDelta {
            id: slot.id.clone(),
            fragment: fragment.to_string(),
        })
    }

    /// Closes every open slot in index order and clears the map.
    ///
    /// Each slot yields a `tool_call_end` with well-formed JSON arguments, or
    /// a `malformed_arguments` error when the buffer cannot be repaired.
    pub fn flush(&mut self) -> Vec<StreamChunk> {
        std::mem::take(&mut self.slots)
            .into_values()
            .map(|call| match repair_json(&call.arguments) {
                Some(arguments) => StreamChunk::ToolCallEnd {
                    id: call.id,
                    name: call.name,
                    arguments,
                },
                None => {
                    warn!(call_id = %call.id, tool = %call.name, "Unrepairable tool arguments");
                    StreamChunk::error(
                        "malformed_arguments",
                        format!(
                            "arguments for tool call {} ({}) are not valid JSON",
                            call.id, call.name
                        ),
                    )
                }
            })
            .collect()
    }
}

/// Builds the chunk sequence for a whole (non-streamed) response so that
/// consumers see the same vocabulary in both modes.
pub fn synthesize_chunks(
    text: Option<String>,
    tool_calls: Vec<(String, String, String)>,
    finish_reason: FinishReason,
    usage: Option<TokenUsage>,
) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        chunks.push(StreamChunk::delta(text));
    }
    let mut acc = ToolCallAccumulator::new();
    for (index, (id, name, arguments)) in tool_calls.into_iter().enumerate() {
        chunks.push(acc.start(index, id, name));
        chunks.extend(acc.push(index, &arguments));
    }
    chunks.extend(acc.flush());
    chunks.push(StreamChunk::finish(finish_reason));
    if let Some(usage) = usage {
        chunks.push(StreamChunk::Usage(usage));
    }
    chunks
}

/// Server-sent events decoded from an HTTP response body.
pub type SseStream =
    Pin<Box<dyn Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

/// Sends an HTTP request within `timeout` and checks the status line.
pub async fn send_http(
    vendor: &'static str,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, LlmError> {
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| LlmError::Timeout(timeout.as_secs()))?
        .map_err(|e| LlmError::Api(e.to_string()))?;

    let status = response.status();
    debug!(vendor, status = status.as_u16(), "Provider response received");
    if status.as_u16() == 429 {
        return Err(LlmError::RateLimit);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(500).collect();
        return Err(LlmError::Api(format!("HTTP {status}: {preview}")));
    }
    Ok(response)
}

pub fn sse_stream(response: reqwest::Response) -> SseStream {
    Box::pin(response.bytes_stream().eventsource())
}

/// Per-vendor hooks used by [`spawn_pump`].
pub struct PumpHooks<T, St> {
    pub vendor: &'static str,
    pub parse: fn(T, &mut St) -> Vec<StreamChunk>,
    /// Called once when the vendor stream ends without an error.
    pub finish: fn(&mut St) -> Vec<StreamChunk>,
}

/// Spawns the task that drives a vendor event stream into a [`ChunkStream`].
///
/// The task stops on cancellation, when the consumer drops the stream, after
/// an `error` chunk, or when no event arrives within `idle_timeout` (which is
/// reported as a `timeout` error chunk).
pub fn spawn_pump<S, T, E, St>(
    stream: S,
    mut state: St,
    hooks: PumpHooks<T, St>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> ChunkStream
where
    S: Stream<Item = Result<T, E>> + Send + Unpin + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
    St: Send + 'static,
{
    let (tx, chunks) = ChunkStream::channel();
    let vendor = hooks.vendor;

    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(vendor, "Provider stream cancelled");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, stream.next()) => next,
            };

            let produced = match next {
                Err(_) => {
                    warn!(vendor, timeout_secs = idle_timeout.as_secs(), "Provider stream idle timeout");
                    vec![StreamChunk::error(
                        "timeout",
                        format!("{vendor} stream idle for {}s", idle_timeout.as_secs()),
                    )]
                }
                Ok(None) => {
                    let tail = (hooks.finish)(&mut state);
                    for chunk in tail {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
                Ok(Some(Err(e))) => {
                    warn!(vendor, error = %e, "Provider stream failed");
                    vec![StreamChunk::error("stream_error", e.to_string())]
                }
                Ok(Some(Ok(item))) => (hooks.parse)(item, &mut state),
            };

            let mut terminal = false;
            for chunk in produced {
                trace!(vendor, kind = chunk.kind(), "Normalized chunk");
                terminal |= chunk.is_error();
                if tx.send(chunk).await.is_err() {
                    debug!(vendor, "Chunk consumer dropped");
                    return;
                }
            }
            if terminal {
                return;
            }
        }
    });

    chunks
}
