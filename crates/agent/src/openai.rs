//! OpenAI Chat Completions provider. Tool-call arguments arrive as fragments
//! keyed by their position index within the response.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionStreamOptions, ChatCompletionTool, ChatCompletionToolType, CompletionUsage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
        CreateChatCompletionStreamResponse, FinishReason as OpenAiFinishReason, FunctionCall,
        FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use proto::{FinishReason, LlmError, Message, Role, StreamChunk, TokenUsage, ToolDefinition};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::llm::{ChatRequest, ChunkStream, LlmProvider, ProviderSettings};
use crate::stream::{PumpHooks, ToolCallAccumulator, spawn_pump, synthesize_chunks};

/// OpenAI-compatible provider (works with OpenAI, together.ai, etc.)
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    timeout: Duration,
    max_output_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(settings.api_key);
        if let Some(base_url) = settings.base_url {
            config = config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(config),
            timeout: settings.timeout,
            max_output_tokens: settings.max_output_tokens,
        }
    }

    fn build_request(&self, req: &ChatRequest) -> Result<CreateChatCompletionRequest, LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> = req
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<_, _>>()?;
        let tools: Vec<ChatCompletionTool> = req
            .tools
            .iter()
            .map(convert_tool)
            .collect::<Result<_, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&req.model)
            .messages(messages)
            .max_completion_tokens(self.max_output_tokens);
        if !tools.is_empty() {
            builder.tools(tools);
        }
        if req.stream {
            builder
                .stream(true)
                .stream_options(ChatCompletionStreamOptions {
                    include_usage: true,
                });
        }
        builder
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))
    }

    async fn send_whole(&self, request: CreateChatCompletionRequest) -> ChunkStream {
        let response = match tokio::time::timeout(self.timeout, self.client.chat().create(request)).await {
            Err(_) => return ChunkStream::failed(&LlmError::Timeout(self.timeout.as_secs())),
            Ok(Err(e)) => return ChunkStream::failed(&map_openai_error(e)),
            Ok(Ok(response)) => response,
        };

        let usage = response.usage.as_ref().map(convert_usage);
        let Some(choice) = response.choices.into_iter().next() else {
            return ChunkStream::failed(&LlmError::InvalidResponse(
                "No choices in response".to_string(),
            ));
        };
        let calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| (tc.id, tc.function.name, tc.function.arguments))
            .collect();
        let finish = choice
            .finish_reason
            .map(map_finish_reason)
            .unwrap_or(FinishReason::Stop);
        ChunkStream::from_chunks(synthesize_chunks(
            choice.message.content,
            calls,
            finish,
            usage,
        ))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: ChatRequest, cancel: CancellationToken) -> Result<ChunkStream, LlmError> {
        let request = self.build_request(&req)?;
        debug!(
            model = %req.model,
            messages = req.messages.len(),
            tools = req.tools.len(),
            stream = req.stream,
            "Sending request to OpenAI"
        );

        if !req.stream {
            return Ok(self.send_whole(request).await);
        }

        let stream = match tokio::time::timeout(self.timeout, self.client.chat().create_stream(request)).await {
            Err(_) => return Ok(ChunkStream::failed(&LlmError::Timeout(self.timeout.as_secs()))),
            Ok(Err(e)) => return Ok(ChunkStream::failed(&map_openai_error(e))),
            Ok(Ok(stream)) => stream,
        };

        Ok(spawn_pump(
            stream,
            OpenAiStreamState::default(),
            PumpHooks {
                vendor: "openai",
                parse: parse_chunk,
                finish: finish_stream,
            },
            self.timeout,
            cancel,
        ))
    }
}

/// Accumulation state for one streamed OpenAI response.
#[derive(Debug, Default)]
pub struct OpenAiStreamState {
    tools: ToolCallAccumulator,
    finished: bool,
}

/// Normalizes one streamed completion chunk.
pub fn parse_chunk(
    raw: CreateChatCompletionStreamResponse,
    state: &mut OpenAiStreamState,
) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();

    for choice in raw.choices.into_iter().filter(|c| c.index == 0) {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            chunks.push(StreamChunk::delta(text));
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            let index = call.index as usize;
            let (name, fragment) = match call.function {
                Some(function) => (function.name, function.arguments),
                None => (None, None),
            };
            if !state.tools.is_open(index) {
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{index}"));
                chunks.push(state.tools.start(index, id, name.unwrap_or_default()));
            }
            if let Some(fragment) = fragment {
                chunks.extend(state.tools.push(index, &fragment));
            }
        }

        if let Some(reason) = choice.finish_reason {
            chunks.extend(state.tools.flush());
            chunks.push(StreamChunk::finish(map_finish_reason(reason)));
            state.finished = true;
        }
    }

    if let Some(usage) = raw.usage.as_ref() {
        chunks.push(StreamChunk::Usage(convert_usage(usage)));
    }
    chunks
}

fn finish_stream(state: &mut OpenAiStreamState) -> Vec<StreamChunk> {
    let mut chunks = state.tools.flush();
    if !state.finished {
        chunks.push(StreamChunk::finish(FinishReason::StreamEnd));
    }
    chunks
}

fn map_finish_reason(reason: OpenAiFinishReason) -> FinishReason {
    match reason {
        OpenAiFinishReason::Stop => FinishReason::Stop,
        OpenAiFinishReason::Length => FinishReason::Length,
        OpenAiFinishReason::ToolCalls | OpenAiFinishReason::FunctionCall => FinishReason::ToolCalls,
        OpenAiFinishReason::ContentFilter => FinishReason::Safety,
    }
}

fn convert_usage(usage: &CompletionUsage) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

fn map_openai_error(err: OpenAIError) -> LlmError {
    let msg = err.to_string();
    debug!(error = %msg, "OpenAI API error");
    let lower = msg.to_lowercase();
    if lower.contains("rate limit") || lower.contains("rate_limit") {
        LlmError::RateLimit
    } else {
        LlmError::Api(msg)
    }
}

/// Converts internal chat message into OpenAI request format.
fn convert_message(m: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
    let serialization = |e: OpenAIError| LlmError::Serialization(e.to_string());
    match m.role {
        Role::System => Ok(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(m.text().to_string())
                .build()
                .map_err(serialization)?,
        )),
        Role::User => Ok(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(m.text().to_string())
                .build()
                .map_err(serialization)?,
        )),
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(content) = &m.content {
                builder.content(content.clone());
            }
            if let Some(tool_calls) = &m.tool_calls {
                let calls: Vec<ChatCompletionMessageToolCall> = tool_calls
                    .iter()
                    .map(|tc| ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect();
                builder.tool_calls(calls);
            }
            Ok(ChatCompletionRequestMessage::Assistant(
                builder.build().map_err(serialization)?,
            ))
        }
        Role::Tool => {
            let call_id = m
                .tool_call_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            Ok(ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call_id)
                    .content(m.text().to_string())
                    .build()
                    .map_err(serialization)?,
            ))
        }
    }
}

/// Converts internal tool schema into OpenAI function-tool declaration.
fn convert_tool(t: &ToolDefinition) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(t.parameters.clone())
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?,
    })
}
