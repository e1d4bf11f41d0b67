//! Gemini `generateContent` provider. Function calls arrive as whole objects
//! inside response parts, so every call is emitted as a start immediately
//! followed by its end.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Event;
use proto::{FinishReason, LlmError, Message, Role, SafetyAnnotation, StreamChunk, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::json_repair::repair_json;
use crate::llm::{ChatRequest, ChunkStream, LlmProvider, ProviderSettings};
use crate::stream::{PumpHooks, send_http, spawn_pump, sse_stream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTools>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

// ── Response types ─────────────────────────────────────────────────────────────

/// One `generateContent` response, or one streamed slice of it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Deserialize)]
struct SafetyRating {
    category: String,
    probability: String,
    #[serde(default)]
    blocked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<SafetyRating>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(value: UsageMetadata) -> Self {
        let mut usage = TokenUsage::new(value.prompt_token_count, value.candidates_token_count);
        if value.total_token_count > 0 {
            usage.total_tokens = value.total_token_count;
        }
        usage
    }
}

impl From<&SafetyRating> for SafetyAnnotation {
    fn from(rating: &SafetyRating) -> Self {
        SafetyAnnotation {
            category: rating.category.clone(),
            probability: rating.probability.clone(),
            blocked: rating.blocked,
        }
    }
}

// ── Provider ───────────────────────────────────────────────────────────────────

/// Google Gemini LLM provider.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_output_tokens: u32,
}

impl GeminiProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: settings.api_key,
            base_url: settings
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: settings.timeout,
            max_output_tokens: settings.max_output_tokens,
        }
    }

    fn build_request(&self, req: &ChatRequest) -> GeminiRequest {
        let system_parts: Vec<Part> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| Part {
                text: Some(m.text().to_string()),
                ..Part::default()
            })
            .collect();
        let tools = if req.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTools {
                function_declarations: req
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        GeminiRequest {
            contents: convert_messages(&req.messages),
            system_instruction: (!system_parts.is_empty()).then(|| Content {
                role: None,
                parts: system_parts,
            }),
            tools,
            generation_config: GenerationConfig {
                max_output_tokens: self.max_output_tokens,
            },
        }
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
                self.base_url
            )
        } else {
            format!("{}/v1beta/models/{model}:generateContent", self.base_url)
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn send(&self, req: ChatRequest, cancel: CancellationToken) -> Result<ChunkStream, LlmError> {
        let body = self.build_request(&req);
        debug!(
            model = %req.model,
            contents = body.contents.len(),
            tools = req.tools.len(),
            stream = req.stream,
            "Sending request to Gemini"
        );

        let request = self
            .client
            .post(self.endpoint(&req.model, req.stream))
            .header("x-goog-api-key", &self.api_key)
            .json(&body);

        let response = match send_http("gemini", request, self.timeout).await {
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
            return Ok(match serde_json::from_str::<GeminiResponse>(&text) {
                Ok(parsed) => {
                    let mut state = GeminiStreamState::default();
                    let mut chunks = parse_chunk(parsed, &mut state);
                    chunks.extend(finish_stream(&mut state));
                    ChunkStream::from_chunks(chunks)
                }
                Err(e) => ChunkStream::failed(&LlmError::InvalidResponse(e.to_string())),
            });
        }

        Ok(spawn_pump(
            sse_stream(response),
            GeminiStreamState::default(),
            PumpHooks {
                vendor: "gemini",
                parse: parse_event,
                finish: finish_stream,
            },
            self.timeout,
            cancel,
        ))
    }
}

// ── Stream normalization ──────────────────────────────────────────────────────

/// Accumulation state for one Gemini response.
#[derive(Debug, Default)]
pub struct GeminiStreamState {
    /// Gemini assigns no call ids; they are numbered per response.
    next_call: usize,
    saw_calls: bool,
    usage: Option<TokenUsage>,
    finished: bool,
}

fn parse_event(event: Event, state: &mut GeminiStreamState) -> Vec<StreamChunk> {
    match serde_json::from_str::<GeminiResponse>(&event.data) {
        Ok(parsed) => parse_chunk(parsed, state),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable Gemini event");
            Vec::new()
        }
    }
}

/// Normalizes one Gemini response slice.
pub fn parse_chunk(raw: GeminiResponse, state: &mut GeminiStreamState) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();

    // Usage is cumulative across slices; only the latest value is kept.
    if let Some(usage) = raw.usage_metadata {
        state.usage = Some(usage.into());
    }

    if let Some(feedback) = raw.prompt_feedback
        && let Some(reason) = feedback.block_reason
    {
        warn!(block_reason = %reason, "Gemini blocked the prompt");
        state.finished = true;
        chunks.push(StreamChunk::Meta {
            finish_reason: Some(FinishReason::Safety),
            safety: feedback.safety_ratings.iter().map(SafetyAnnotation::from).collect(),
        });
        chunks.extend(state.usage.take().map(StreamChunk::Usage));
        return chunks;
    }

    let Some(candidate) = raw.candidates.into_iter().next() else {
        return chunks;
    };

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            chunks.push(StreamChunk::delta(text));
        }
        if let Some(call) = part.function_call {
            let id = format!("call_{}", state.next_call);
            state.next_call += 1;
            state.saw_calls = true;
            let args = if call.args.is_null() {
                "{}".to_string()
            } else {
                call.args.to_string()
            };
            chunks.push(StreamChunk::ToolCallStart {
                id: id.clone(),
                name: call.name.clone(),
                arguments: args.clone(),
            });
            match repair_json(&args) {
                Some(arguments) => chunks.push(StreamChunk::ToolCallEnd {
                    id,
                    name: call.name,
                    arguments,
                }),
                None => chunks.push(StreamChunk::error(
                    "malformed_arguments",
                    format!("arguments for tool call {id} ({}) are not valid JSON", call.name),
                )),
            }
        }
    }

    if let Some(reason) = candidate.finish_reason {
        state.finished = true;
        chunks.push(StreamChunk::Meta {
            finish_reason: Some(map_finish_reason(&reason, state.saw_calls)),
            safety: candidate
                .safety_ratings
                .iter()
                .map(SafetyAnnotation::from)
                .collect(),
        });
        chunks.extend(state.usage.take().map(StreamChunk::Usage));
    }

    chunks
}

fn finish_stream(state: &mut GeminiStreamState) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if !state.finished {
        chunks.push(StreamChunk::finish(FinishReason::StreamEnd));
    }
    chunks.extend(state.usage.take().map(StreamChunk::Usage));
    chunks
}

/// Gemini reports `STOP` even when the turn ends in function calls.
fn map_finish_reason(reason: &str, saw_calls: bool) -> FinishReason {
    match reason {
        "STOP" if saw_calls => FinishReason::ToolCalls,
        "STOP" | "FINISH_REASON_UNSPECIFIED" | "OTHER" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::Safety
        }
        other => {
            debug!(finish_reason = other, "Unmapped Gemini finish reason");
            FinishReason::Error
        }
    }
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

/// Converts messages into Gemini `contents`. Assistant turns use the `model`
/// role and consecutive tool results share one `user` content.
fn convert_messages(messages: &[Message]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::User => contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(msg.text().to_string()),
                    ..Part::default()
                }],
            }),
            Role::Assistant => {
                let mut parts = Vec::new();
                if let Some(text) = msg.content.as_ref().filter(|t| !t.is_empty()) {
                    parts.push(Part {
                        text: Some(text.clone()),
                        ..Part::default()
                    });
                }
                for call in msg.tool_calls.iter().flatten() {
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: call.arguments_value(),
                        }),
                        ..Part::default()
                    });
                }
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts,
                });
            }
            Role::Tool => {
                let output = serde_json::from_str::<Value>(msg.text())
                    .unwrap_or_else(|_| Value::String(msg.text().to_string()));
                let response = if output.is_object() {
                    output
                } else {
                    json!({ "result": output })
                };
                let part = Part {
                    function_response: Some(FunctionResponse {
                        name: msg.tool_name.clone().unwrap_or_default(),
                        response,
                    }),
                    ..Part::default()
                };
                match contents.last_mut() {
                    Some(last)
                        if last.role.as_deref() == Some("user")
                            && last.parts.iter().all(|p| p.function_response.is_some()) =>
                    {
                        last.parts.push(part)
                    }
                    _ => contents.push(Content {
                        role: Some("user".to_string()),
                        parts: vec![part],
                    }),
                }
            }
        }
    }

    contents
}

#[cfg(test)]
mod tests {
    use proto::{ToolCallRequest, ToolDefinition};

    use super::*;

    fn response(data: Value) -> GeminiResponse {
        serde_json::from_value(data).expect("valid response")
    }

    #[test]
    fn whole_function_calls_become_start_then_end() {
        let mut state = GeminiStreamState::default();
        let chunks = parse_chunk(
            response(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "Saving."},
                        {"functionCall": {"name": "save_note", "args": {"key": "goal", "value": 3}}},
                        {"functionCall": {"name": "read_notes", "args": {}}}
                    ]},
                    "finishReason": "STOP",
                    "safetyRatings": [{"category": "HARM_CATEGORY_HARASSMENT", "probability": "NEGLIGIBLE"}]
                }],
                "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 4, "totalTokenCount": 13}
            })),
            &mut state,
        );

        let kinds: Vec<_> = chunks.iter().map(StreamChunk::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "delta",
                "tool_call_start",
                "tool_call_end",
                "tool_call_start",
                "tool_call_end",
                "meta",
                "usage"
            ]
        );
        assert_eq!(
            chunks[2],
            StreamChunk::ToolCallEnd {
                id: "call_0".into(),
                name: "save_note".into(),
                arguments: r#"{"key":"goal","value":3}"#.into(),
            }
        );
        let StreamChunk::Meta {
            finish_reason,
            safety,
        } = &chunks[5]
        else {
            panic!("expected meta chunk");
        };
        assert_eq!(*finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(safety[0].category, "HARM_CATEGORY_HARASSMENT");
        assert_eq!(chunks[6], StreamChunk::Usage(TokenUsage::new(9, 4)));
    }

    #[test]
    fn streamed_slices_report_usage_once() {
        let mut state = GeminiStreamState::default();
        let first = parse_chunk(
            response(json!({
                "candidates": [{"content": {"parts": [{"text": "Hel"}]}}],
                "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1}
            })),
            &mut state,
        );
        assert_eq!(first, vec![StreamChunk::delta("Hel")]);

        let second = parse_chunk(
            response(json!({
                "candidates": [{"content": {"parts": [{"text": "lo"}]}, "finishReason": "MAX_TOKENS"}],
                "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
            })),
            &mut state,
        );
        assert_eq!(second[0], StreamChunk::delta("lo"));
        assert!(matches!(&second[1], StreamChunk::Meta { finish_reason: Some(FinishReason::Length), .. }));
        assert_eq!(second[2], StreamChunk::Usage(TokenUsage::new(5, 2)));
        assert!(finish_stream(&mut state).is_empty());
    }

    #[test]
    fn blocked_prompt_maps_to_safety() {
        let mut state = GeminiStreamState::default();
        let chunks = parse_chunk(
            response(json!({
                "promptFeedback": {
                    "blockReason": "SAFETY",
                    "safetyRatings": [{"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "probability": "HIGH", "blocked": true}]
                }
            })),
            &mut state,
        );
        let StreamChunk::Meta { finish_reason, safety } = &chunks[0] else {
            panic!("expected meta chunk");
        };
        assert_eq!(*finish_reason, Some(FinishReason::Safety));
        assert!(safety[0].blocked);
    }

    #[test]
    fn stream_without_finish_reason_ends_with_stream_end() {
        let mut state = GeminiStreamState::default();
        parse_chunk(
            response(json!({"candidates": [{"content": {"parts": [{"text": "partial"}]}}]})),
            &mut state,
        );
        assert_eq!(
            finish_stream(&mut state),
            vec![StreamChunk::finish(FinishReason::StreamEnd)]
        );
    }

    #[test]
    fn finish_reasons_map_to_closed_set() {
        assert_eq!(map_finish_reason("STOP", false), FinishReason::Stop);
        assert_eq!(map_finish_reason("RECITATION", false), FinishReason::Safety);
        assert_eq!(map_finish_reason("MALFORMED_FUNCTION_CALL", true), FinishReason::Error);
    }

    #[test]
    fn tool_results_become_function_responses() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant_tool_calls(
                None,
                vec![
                    ToolCallRequest::new("call_0", "save_note", r#"{"key":"a"}"#),
                    ToolCallRequest::new("call_1", "count_characters", r#"{"text":"x"}"#),
                ],
            ),
            Message::tool_result("call_0", "save_note", r#"{"saved":true}"#),
            Message::tool_result("call_1", "count_characters", "7"),
        ];
        let contents = convert_messages(&msgs);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1].role.as_deref(), Some("model"));
        assert_eq!(contents[1].parts.len(), 2);
        assert_eq!(contents[2].parts.len(), 2);
        let response = &contents[2].parts[1].function_response.as_ref().expect("response").response;
        assert_eq!(response, &json!({"result": 7}));
    }

    #[test]
    fn request_carries_system_instruction_and_declarations() {
        let provider = GeminiProvider::new(ProviderSettings::new("key"));
        let body = provider.build_request(&ChatRequest {
            messages: vec![Message::system("Be brief"), Message::user("hi")],
            tools: vec![ToolDefinition::new("echo", "Echo", json!({"type":"object"}))],
            model: "gemini-2.0-flash".into(),
            stream: true,
        });
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "Be brief");
        assert_eq!(json["tools"][0]["functionDeclarations"][0]["name"], "echo");
        assert_eq!(json["contents"].as_array().map(Vec::len), Some(1));
        assert!(provider.endpoint("m", true).ends_with(":streamGenerateContent?alt=sse"));
    }
}
