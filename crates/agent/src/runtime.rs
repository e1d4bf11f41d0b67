//! Agent turn loop: preprocessing, provider rounds, guarded tool execution,
//! and memory bookkeeping.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use proto::{
    AgentEvent, ErrorPayload, FinishReason, GuardrailViolation, LlmError, Message, SessionId,
    StreamChunk, TokenUsage, ToolCallRequest, ToolResult,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::ToolContext;
use tracing::{debug, info, warn};

use crate::{
    guardrail::{Guardrail, NoopGuardrail, ToolDenialPolicy},
    llm::{ChatRequest, LlmProvider},
    memory::ConversationMemory,
    tool_registry::ToolRegistry,
};

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;
pub const DEFAULT_MEMORY_WINDOW: usize = 20;
pub const DEFAULT_MEMORY_MAX_ITEMS: usize = 200;

/// Static configuration of one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub instructions: String,
    pub model: String,
    /// Maximum provider calls per turn.
    pub max_tool_rounds: usize,
    /// Most recent memory entries replayed per turn; `0` replays all.
    pub memory_window: usize,
    pub memory_max_items: usize,
    pub stream: bool,
    pub tool_denial: ToolDenialPolicy,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            model: model.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            memory_window: DEFAULT_MEMORY_WINDOW,
            memory_max_items: DEFAULT_MEMORY_MAX_ITEMS,
            stream: true,
            tool_denial: ToolDenialPolicy::default(),
        }
    }
}

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Preprocessing,
    AwaitingProvider,
    ToolPending,
    ToolExecuting,
    Done,
    Error,
}

/// Successful end of a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    /// Final assistant text (after output guardrail rewriting).
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<FinishReason>,
    /// Provider calls made during the turn.
    pub rounds: usize,
    pub tool_results: Vec<ToolResult>,
}

/// Turn-terminal failure handed to the caller as a structured payload.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("agent {agent} failed: {payload}")]
pub struct TurnFailure {
    pub agent: String,
    pub payload: ErrorPayload,
}

/// One conversational agent: instructions, a provider, tools, a guardrail and
/// a bounded memory per session.
///
/// Memory is keyed by [`ToolContext::session_id`]; turns without a session
/// share one anonymous memory. When the context carries a store, a session's
/// memory is loaded from it on first use and every completed turn is appended
/// to it. Only completed turns are remembered.
pub struct Agent {
    config: AgentConfig,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    guardrail: Arc<dyn Guardrail>,
    memory: DashMap<Option<SessionId>, ConversationMemory>,
    phase: Mutex<TurnPhase>,
}

/// Messages and tool calls gathered from one provider round.
#[derive(Default)]
struct RoundOutput {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    finish_reason: Option<FinishReason>,
}

impl Agent {
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            config,
            llm,
            tools,
            guardrail: Arc::new(NoopGuardrail),
            memory: DashMap::new(),
            phase: Mutex::new(TurnPhase::Idle),
        }
    }

    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrail = guardrail;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn phase(&self) -> TurnPhase {
        *self.phase.lock()
    }

    /// Snapshot of everything retained for `session_id` (`None` is the
    /// anonymous memory).
    pub fn memory_snapshot(&self, session_id: Option<&SessionId>) -> Vec<Message> {
        self.memory
            .get(&session_id.cloned())
            .map(|memory| memory.window(0))
            .unwrap_or_default()
    }

    /// Drops the in-process memory of one session. Persisted history is kept.
    pub fn clear_memory(&self, session_id: Option<&SessionId>) {
        self.memory.remove(&session_id.cloned());
    }

    /// Runs one turn and returns the final assistant reply.
    pub async fn run_turn(
        &self,
        ctx: &ToolContext,
        input: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<TurnReply, TurnFailure> {
        self.turn(ctx, input, cancel, None).await
    }

    /// Like [`Agent::run_turn`], additionally re-emitting progress events.
    /// Events are dropped when the receiver is full or gone.
    pub async fn run_turn_with_events(
        &self,
        ctx: &ToolContext,
        input: Vec<Message>,
        cancel: &CancellationToken,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<TurnReply, TurnFailure> {
        self.turn(ctx, input, cancel, Some(&events)).await
    }

    async fn turn(
        &self,
        ctx: &ToolContext,
        input: Vec<Message>,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<TurnReply, TurnFailure> {
        self.set_phase(TurnPhase::Preprocessing);

        self.hydrate_memory(ctx).await;

        let mut messages = Vec::with_capacity(input.len() + 1);
        if !self.config.instructions.is_empty() {
            messages.push(Message::system(self.config.instructions.clone()));
        }
        let history = self
            .memory
            .get(&ctx.session_id)
            .map(|memory| memory.window(self.config.memory_window))
            .unwrap_or_default();
        messages.extend(history);
        // Committed to memory only when the turn completes.
        let mut turn_log = input.clone();
        messages.extend(input);

        let tool_defs = self.tools.definitions();
        let mut round = 0;
        let mut total_usage = TokenUsage::default();
        let mut tool_results = Vec::new();

        loop {
            if round >= self.config.max_tool_rounds {
                warn!(
                    agent = %self.config.name,
                    max_tool_rounds = self.config.max_tool_rounds,
                    "Max tool rounds reached"
                );
                return Err(self.fail(LlmError::MaxToolRoundsExceeded(self.config.max_tool_rounds).payload()));
            }

            messages = match self.guardrail.check_input(messages).await {
                Ok(messages) => messages,
                Err(violation) => {
                    warn!(agent = %self.config.name, error = %violation, "Input rejected by guardrail");
                    return Err(self.fail(violation.payload()));
                }
            };

            self.set_phase(TurnPhase::AwaitingProvider);
            emit(
                events,
                AgentEvent::ProviderRound {
                    agent: self.config.name.clone(),
                    round,
                },
            );
            debug!(agent = %self.config.name, round, provider = self.llm.name(), "Provider call");

            let request = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                model: self.config.model.clone(),
                stream: self.config.stream,
            };
            let output = self.consume_round(request, cancel, events, &mut total_usage).await?;
            round += 1;

            if output.tool_calls.is_empty() {
                let reply_text = output.text;
                if !reply_text.is_empty() {
                    turn_log.push(Message::assistant(reply_text.clone()));
                }
                self.commit_turn(ctx, turn_log).await;
                self.set_phase(TurnPhase::Done);
                info!(
                    agent = %self.config.name,
                    rounds = round,
                    prompt_tokens = total_usage.prompt_tokens,
                    completion_tokens = total_usage.completion_tokens,
                    "Turn complete"
                );
                return Ok(TurnReply {
                    text: reply_text,
                    usage: total_usage,
                    finish_reason: output.finish_reason,
                    rounds: round,
                    tool_results,
                });
            }

            let assistant = Message::assistant_tool_calls(Some(output.text), output.tool_calls.clone());
            messages.push(assistant.clone());
            turn_log.push(assistant);

            self.set_phase(TurnPhase::ToolExecuting);
            for call in &output.tool_calls {
                if cancel.is_cancelled() {
                    return Err(self.fail(LlmError::Cancelled.payload()));
                }
                let result = self.run_tool_call(ctx, call, events).await?;
                let message = Message::tool_result(&result.call_id, &result.tool_name, result.content());
                messages.push(message.clone());
                turn_log.push(message);
                tool_results.push(result);
            }
        }
    }

    /// Seeds a session's memory from the store the first time it is seen.
    async fn hydrate_memory(&self, ctx: &ToolContext) {
        if self.memory.contains_key(&ctx.session_id) {
            return;
        }
        let mut memory = ConversationMemory::new(self.config.memory_max_items);
        if let (Some(store), Some(session_id)) = (&ctx.store, &ctx.session_id) {
            match store
                .load_history(session_id, &self.config.name, self.config.memory_max_items)
                .await
            {
                Ok(history) => {
                    debug!(agent = %self.config.name, session_id = %session_id, count = history.len(), "Loaded agent history");
                    memory.extend(history);
                }
                Err(err) => {
                    warn!(agent = %self.config.name, session_id = %session_id, error = %err, "Failed to load agent history");
                }
            }
        }
        self.memory.entry(ctx.session_id.clone()).or_insert(memory);
    }

    async fn commit_turn(&self, ctx: &ToolContext, turn_log: Vec<Message>) {
        let turn_log: Vec<Message> = turn_log.into_iter().filter(Message::has_payload).collect();
        self.memory
            .entry(ctx.session_id.clone())
            .or_insert_with(|| ConversationMemory::new(self.config.memory_max_items))
            .extend(turn_log.iter().cloned());

        if let (Some(store), Some(session_id)) = (&ctx.store, &ctx.session_id)
            && let Err(err) = store.append_history(session_id, &self.config.name, &turn_log).await
        {
            warn!(agent = %self.config.name, session_id = %session_id, error = %err, "Failed to save agent history");
        }
    }

    /// Drains one provider round, applying the output guardrail to every chunk.
    async fn consume_round(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<AgentEvent>>,
        total_usage: &mut TokenUsage,
    ) -> Result<RoundOutput, TurnFailure> {
        let mut stream = match self.llm.send(request, cancel.child_token()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(agent = %self.config.name, error = %err, "Provider request failed");
                return Err(self.fail(err.payload()));
            }
        };

        let mut output = RoundOutput::default();
        let mut open_calls: HashSet<String> = HashSet::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(self.fail(LlmError::Cancelled.payload()));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = match self.guardrail.check_output(chunk).await {
                Ok(chunk) => chunk,
                Err(violation) => {
                    warn!(agent = %self.config.name, error = %violation, "Output rejected by guardrail");
                    return Err(self.fail(violation.payload()));
                }
            };

            match chunk {
                StreamChunk::Delta { text } => {
                    output.text.push_str(&text);
                    emit(
                        events,
                        AgentEvent::TextDelta {
                            agent: self.config.name.clone(),
                            text,
                        },
                    );
                }
                StreamChunk::ToolCallStart { id, name, .. } => {
                    debug!(agent = %self.config.name, call_id = %id, tool = %name, "Tool call started");
                    open_calls.insert(id);
                    self.set_phase(TurnPhase::ToolPending);
                }
                StreamChunk::ToolCallDelta { .. } => {}
                StreamChunk::ToolCallEnd { id, name, arguments } => {
                    if !open_calls.remove(&id) {
                        warn!(agent = %self.config.name, call_id = %id, "Tool call ended without a start");
                    }
                    output.tool_calls.push(ToolCallRequest::new(id, name, arguments));
                }
                StreamChunk::Meta { finish_reason, .. } => {
                    if finish_reason.is_some() {
                        output.finish_reason = finish_reason;
                    }
                }
                StreamChunk::Usage(usage) => {
                    total_usage.add(&usage);
                    emit(
                        events,
                        AgentEvent::Usage {
                            agent: self.config.name.clone(),
                            usage,
                        },
                    );
                }
                StreamChunk::Error { code, message } => {
                    warn!(agent = %self.config.name, code = %code, error = %message, "Provider stream failed");
                    return Err(self.fail(ErrorPayload::new(code, message).with_detail("provider", self.llm.name())));
                }
            }
        }

        if !open_calls.is_empty() {
            let mut ids: Vec<String> = open_calls.into_iter().collect();
            ids.sort();
            warn!(agent = %self.config.name, call_ids = ?ids, "Stream ended with open tool calls");
            return Err(self.fail(
                ErrorPayload::new("incomplete_tool_call", "stream ended before tool call arguments closed")
                    .with_detail("call_ids", ids),
            ));
        }
        Ok(output)
    }

    async fn run_tool_call(
        &self,
        ctx: &ToolContext,
        call: &ToolCallRequest,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<ToolResult, TurnFailure> {
        let arguments = call.arguments_value();
        emit(
            events,
            AgentEvent::ToolCallStarted {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: arguments.clone(),
            },
        );

        let result = if self.guardrail.can_execute_tool(&call.name, &arguments).await {
            let call_ctx = ctx.clone().with_call_id(call.id.clone());
            self.tools.invoke(&call_ctx, &call.id, &call.name, &call.arguments).await
        } else {
            warn!(agent = %self.config.name, tool = %call.name, call_id = %call.id, "Tool call denied by guardrail");
            match self.config.tool_denial {
                ToolDenialPolicy::Hard => {
                    let violation = GuardrailViolation::new(format!("tool {} is not permitted", call.name))
                        .with_detail("reason_code", "tool_denied")
                        .with_detail("tool", call.name.as_str());
                    return Err(self.fail(violation.payload()));
                }
                ToolDenialPolicy::Soft => ToolResult::error(
                    &call.id,
                    &call.name,
                    &ErrorPayload::new("tool_denied", format!("tool {} was denied by policy", call.name))
                        .with_detail("tool", call.name.as_str()),
                ),
            }
        };

        emit(
            events,
            AgentEvent::ToolCallFinished {
                call_id: result.call_id.clone(),
                tool_name: result.tool_name.clone(),
                output: result.output.clone(),
                is_error: result.is_error,
            },
        );
        Ok(result)
    }

    fn set_phase(&self, phase: TurnPhase) {
        *self.phase.lock() = phase;
    }

    fn fail(&self, payload: ErrorPayload) -> TurnFailure {
        self.set_phase(TurnPhase::Error);
        TurnFailure {
            agent: self.config.name.clone(),
            payload,
        }
    }
}

fn emit(events: Option<&mpsc::Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.try_send(event);
    }
}
