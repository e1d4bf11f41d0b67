//! Anthropic Messages API provider implementation.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Event;
use proto::{FinishReason, LlmError, Message, Role, StreamChunk, TokenUsage, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{ChatRequest, ChunkStream, LlmProvider, ProviderSettings};
use crate::stream::{
    PumpHooks, ToolCallAccumulator, send_http, spawn_pump, sse_stream, synthesize_chunks,
};

const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl AnthropicUsage {
    /// Later events only carry the counters that changed.
    fn update(&mut self, other: &AnthropicUsage) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
    }

    fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }

    fn to_usage(self) -> TokenUsage {
        TokenUsage::new(self.input_tokens.unwrap_or(0), self.output_tokens.unwrap_or(0))
    }
}

/// One decoded `data:` payload of the Messages SSE stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ── Provider ───────────────────────────────────────────────────────────────────

/// Anthropic Messages API LLM provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: settings.api_key,
            base_url: settings
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: settings.timeout,
            max_tokens: settings.max_output_tokens,
        }
    }

    fn build_request(&self, req: &ChatRequest) -> AnthropicRequest {
        // System messages go into the top-level `system` field.
        let system_parts: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .collect();
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        };

        AnthropicRequest {
            model: req.model.clone(),
            max_tokens: self.max_tokens,
            system,
            messages: convert_messages(&req.messages),
            tools: req.tools.iter().map(convert_tool).collect(),
            stream: req.stream,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: ChatRequest, cancel: CancellationToken) -> Result<ChunkStream, LlmError> {
        let body = self.build_request(&req);
        let url = format!("{}/v1/messages", self.base_url);
        debug!(
            model = %req.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            stream = req.stream,
            "Sending request to Anthropic"
        );

        let request = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("x-api-key", &self.api_key)
            .json(&body);

        let response = match send_http("anthropic", request, self.timeout).await {
            Ok(response) => response,
            Err(err) => return Ok(ChunkStream::failed(&err)),
        };

        if !req.stream {
            let text = match tokio::time::timeout(self.timeout, response.text()).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => return Ok(ChunkStream::failed(&LlmError::Api(e.to_string()))),
                Err(_) => {
                    return Ok(ChunkStream::failed(&LlmError::Timeout(self.timeout.as_secs())));
                }
            };
            return Ok(match serde_json::from_str::<AnthropicResponse>(&text) {
                Ok(parsed) => ChunkStream::from_chunks(response_chunks(parsed)),
                Err(e) => ChunkStream::failed(&LlmError::InvalidResponse(format!(
                    "Deserialization error: {e}; body: {}",
                    text.chars().take(200).collect::<String>()
                ))),
            });
        }

        Ok(spawn_pump(
            sse_stream(response),
            AnthropicStreamState::default(),
            PumpHooks {
                vendor: "anthropic",
                parse: parse_event,
                finish: finish_stream,
            },
            self.timeout,
            cancel,
        ))
    }
}

// ── Stream normalization ──────────────────────────────────────────────────────

/// Accumulation state for one streamed Anthropic message.
#[derive(Debug, Default)]
pub struct AnthropicStreamState {
    tools: ToolCallAccumulator,
    usage: AnthropicUsage,
    finished: bool,
}

fn parse_event(event: Event, state: &mut AnthropicStreamState) -> Vec<StreamChunk> {
    if event.data.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
        Ok(parsed) => parse_chunk(parsed, state),
        Err(e) => {
            warn!(event = %event.event, error = %e, "Skipping undecodable Anthropic event");
            Vec::new()
        }
    }
}

/// Normalizes one Anthropic stream event.
///
/// Tool calls are opened at `content_block_start` and fed by
/// `input_json_delta`; they are only closed when `message_delta` carries the
/// stop reason, not at the per-block stop.
pub fn parse_chunk(event: AnthropicStreamEvent, state: &mut AnthropicStreamState) -> Vec<StreamChunk> {
    match event {
        AnthropicStreamEvent::MessageStart { message } => {
            if let Some(usage) = message.usage {
                state.usage.update(&usage);
            }
            Vec::new()
        }
        AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block,
        } => match content_block {
            StartBlock::ToolUse { id, name } => vec![state.tools.start(index, id, name)],
            StartBlock::Text { text } if !text.is_empty() => vec![StreamChunk::delta(text)],
            _ => Vec::new(),
        },
        AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
            BlockDelta::TextDelta { text } if !text.is_empty() => vec![StreamChunk::delta(text)],
            BlockDelta::InputJsonDelta { partial_json } => {
                state.tools.push(index, &partial_json).into_iter().collect()
            }
            _ => Vec::new(),
        },
        AnthropicStreamEvent::MessageDelta { delta, usage } => {
            if let Some(usage) = usage {
                state.usage.update(&usage);
            }
            let mut chunks = Vec::new();
            if let Some(reason) = delta.stop_reason {
                chunks.extend(state.tools.flush());
                chunks.push(StreamChunk::finish(map_stop_reason(&reason)));
                state.finished = true;
            }
            if !state.usage.is_empty() {
                chunks.push(StreamChunk::Usage(state.usage.to_usage()));
            }
            chunks
        }
        AnthropicStreamEvent::Error { error } => {
            let code = match error.error_type.as_str() {
                "rate_limit_error" | "overloaded_error" => "rate_limit",
                _ => "api_error",
            };
            vec![StreamChunk::error(code, error.message)]
        }
        AnthropicStreamEvent::ContentBlockStop { .. }
        | AnthropicStreamEvent::MessageStop
        | AnthropicStreamEvent::Ping
        | AnthropicStreamEvent::Unknown => Vec::new(),
    }
}

fn finish_stream(state: &mut AnthropicStreamState) -> Vec<StreamChunk> {
    let mut chunks = state.tools.flush();
    if !state.finished {
        chunks.push(StreamChunk::finish(FinishReason::StreamEnd));
    }
    chunks
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::Safety,
        other => {
            debug!(stop_reason = other, "Unknown Anthropic stop reason");
            FinishReason::Stop
        }
    }
}

/// Chunk sequence for a whole (non-streamed) message.
fn response_chunks(resp: AnthropicResponse) -> Vec<StreamChunk> {
    let mut text = String::new();
    let mut calls = Vec::new();
    for block in resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => calls.push((id, name, input.to_string())),
            ContentBlock::ToolResult { .. } => {}
        }
    }
    let finish = resp
        .stop_reason
        .as_deref()
        .map(map_stop_reason)
        .unwrap_or(FinishReason::Stop);
    synthesize_chunks(
        Some(text),
        calls,
        finish,
        resp.usage.filter(|u| !u.is_empty()).map(AnthropicUsage::to_usage),
    )
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

/// Converts internal chat messages into Anthropic format.
///
/// System messages are skipped (handled via top-level `system` field).
/// Consecutive `Role::Tool` messages are merged into a single user message
/// with multiple `tool_result` blocks (Anthropic forbids consecutive same-role
/// messages).
fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut result: Vec<AnthropicMessage> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::User => result.push(AnthropicMessage {
                role: "user",
                content: AnthropicContent::Text(msg.text().to_string()),
            }),
            Role::Assistant => match &msg.tool_calls {
                Some(tool_calls) => {
                    let mut blocks = Vec::with_capacity(tool_calls.len() + 1);
                    if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                        blocks.push(ContentBlock::Text { text: text.clone() });
                    }
                    blocks.extend(tool_calls.iter().map(|tc| ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.arguments_value(),
                    }));
                    result.push(AnthropicMessage {
                        role: "assistant",
                        content: AnthropicContent::Blocks(blocks),
                    });
                }
                None => result.push(AnthropicMessage {
                    role: "assistant",
                    content: AnthropicContent::Text(msg.text().to_string()),
                }),
            },
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg
                        .tool_call_id
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    content: msg.text().to_string(),
                };
                // Merge into last user message if it already holds tool_result blocks.
                match result.last_mut() {
                    Some(AnthropicMessage {
                        role: "user",
                        content: AnthropicContent::Blocks(blocks),
                    }) => blocks.push(block),
                    _ => result.push(AnthropicMessage {
                        role: "user",
                        content: AnthropicContent::Blocks(vec![block]),
                    }),
                }
            }
        }
    }

    result
}

fn convert_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use proto::ToolCallRequest;
    use serde_json::json;

    use super::*;

    fn event(data: Value) -> AnthropicStreamEvent {
        serde_json::from_value(data).expect("valid event")
    }

    fn run(events: Vec<Value>) -> (Vec<StreamChunk>, AnthropicStreamState) {
        let mut state = AnthropicStreamState::default();
        let chunks = events
            .into_iter()
            .flat_map(|e| parse_chunk(event(e), &mut state))
            .collect();
        (chunks, state)
    }

    #[test]
    fn block_scoped_tool_call_closes_on_stop_reason() {
        let (chunks, _) = run(vec![
            json!({"type":"message_start","message":{"usage":{"input_tokens":12}}}),
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking."}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu1","name":"save_note","input":{}}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"key\":"}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"goal\"}"}}),
            json!({"type":"content_block_stop","index":1}),
            json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":30}}),
            json!({"type":"message_stop"}),
        ]);

        let kinds: Vec<_> = chunks.iter().map(StreamChunk::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "delta",
                "tool_call_start",
                "tool_call_delta",
                "tool_call_delta",
                "tool_call_end",
                "meta",
                "usage"
            ]
        );
        assert_eq!(
            chunks[4],
            StreamChunk::ToolCallEnd {
                id: "tu1".into(),
                name: "save_note".into(),
                arguments: r#"{"key":"goal"}"#.into(),
            }
        );
        assert_eq!(chunks[5], StreamChunk::finish(FinishReason::ToolCalls));
        assert_eq!(chunks[6], StreamChunk::Usage(TokenUsage::new(12, 30)));
    }

    #[test]
    fn block_stop_alone_does_not_close_tool_call() {
        let (chunks, mut state) = run(vec![
            json!({"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu1","name":"echo"}}),
            json!({"type":"content_block_stop","index":0}),
        ]);
        assert_eq!(chunks.len(), 1);
        let tail = finish_stream(&mut state);
        assert_eq!(
            tail,
            vec![
                StreamChunk::ToolCallEnd {
                    id: "tu1".into(),
                    name: "echo".into(),
                    arguments: "{}".into(),
                },
                StreamChunk::finish(FinishReason::StreamEnd),
            ]
        );
    }

    #[test]
    fn error_event_maps_to_vendor_agnostic_code() {
        let (chunks, _) = run(vec![json!({
            "type":"error",
            "error":{"type":"overloaded_error","message":"Overloaded"}
        })]);
        assert_eq!(chunks, vec![StreamChunk::error("rate_limit", "Overloaded")]);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let (chunks, _) = run(vec![json!({"type":"ping"}), json!({"type":"brand_new_event"})]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn stop_reasons_map_to_closed_set() {
        assert_eq!(map_stop_reason("end_turn"), FinishReason::Stop);
        assert_eq!(map_stop_reason("max_tokens"), FinishReason::Length);
        assert_eq!(map_stop_reason("refusal"), FinishReason::Safety);
    }

    #[test]
    fn whole_response_is_synthesized_into_chunks() {
        let resp: AnthropicResponse = serde_json::from_value(json!({
            "content": [
                {"type":"text","text":"Let me save that."},
                {"type":"tool_use","id":"tu1","name":"save_note","input":{"key":"k","value":1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 3, "output_tokens": 4}
        }))
        .expect("parse");
        let chunks = response_chunks(resp);
        assert_eq!(chunks[0], StreamChunk::delta("Let me save that."));
        assert!(chunks.iter().any(|c| matches!(
            c,
            StreamChunk::ToolCallEnd { arguments, .. } if arguments == r#"{"key":"k","value":1}"#
        )));
        assert_eq!(chunks.last(), Some(&StreamChunk::Usage(TokenUsage::new(3, 4))));
    }

    #[test]
    fn system_messages_are_lifted_out_of_the_message_list() {
        let provider = AnthropicProvider::new(ProviderSettings::new("sk-test"));
        let body = provider.build_request(&ChatRequest {
            messages: vec![Message::system("Be helpful"), Message::user("hello")],
            tools: vec![],
            model: "claude".into(),
            stream: true,
        });
        assert_eq!(body.system.as_deref(), Some("Be helpful"));
        assert_eq!(body.messages.len(), 1);
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["stream"], true);
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn consecutive_tool_results_merged_into_single_user_message() {
        let calls = vec![
            ToolCallRequest::new("tc1", "save_note", r#"{"key":"a"}"#),
            ToolCallRequest::new("tc2", "read_notes", "{}"),
        ];
        let msgs = vec![
            Message::user("start"),
            Message::assistant_tool_calls(Some("Working".into()), calls),
            Message::tool_result("tc1", "save_note", "result-1"),
            Message::tool_result("tc2", "read_notes", "result-2"),
        ];

        let converted = convert_messages(&msgs);
        assert_eq!(converted.len(), 3);

        let AnthropicContent::Blocks(ref assistant) = converted[1].content else {
            panic!("expected blocks for assistant with tool calls");
        };
        assert!(matches!(&assistant[0], ContentBlock::Text { text } if text == "Working"));
        assert!(matches!(&assistant[1], ContentBlock::ToolUse { input, .. } if input["key"] == "a"));

        let AnthropicContent::Blocks(ref blocks) = converted[2].content else {
            panic!("expected blocks in merged user message");
        };
        assert_eq!(blocks.len(), 2);
        assert!(
            matches!(&blocks[1], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tc2")
        );
    }

    #[test]
    fn tool_result_not_merged_when_preceded_by_assistant_text() {
        let msgs = vec![
            Message::user("hi"),
            Message::assistant("I'll help"),
            Message::tool_result("tc1", "echo", "output"),
        ];
        let converted = convert_messages(&msgs);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[2].role, "user");
    }

    #[test]
    fn convert_tool_maps_fields_correctly() {
        let def = ToolDefinition::new("echo", "Echo input", json!({"type": "object"}));
        let t = convert_tool(&def);
        assert_eq!(t.name, "echo");
        assert_eq!(t.input_schema, json!({"type": "object"}));
    }
}
