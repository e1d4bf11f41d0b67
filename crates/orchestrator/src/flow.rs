//! Step state machine: conditional skip, bounded micro-retries, and one
//! macro-reflection per finished session.

use std::collections::HashMap;
use std::sync::Arc;

use agent::{Agent, TurnFailure};
use async_trait::async_trait;
use proto::{AgentEvent, FlowError, Message, ReflectionKind, SessionId, SessionStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::ToolContext;
use tracing::{debug, error, info, warn};

use crate::output::StepOutput;
use crate::steps::Step;

pub const DEFAULT_MAX_STEP_RETRIES: usize = 3;
/// Persisted when the terminal step gives no usable `next_step` hint. A hint
/// naming a step would reopen the flow, so it is replaced by this marker.
pub const COMPLETE: &str = "complete";
const MACRO_AGENT: &str = "macro_reflection";

/// Anything that can answer one step turn. [`Agent`] is the production
/// implementation; tests plug in scripted stand-ins.
#[async_trait]
pub trait StepAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(
        &self,
        ctx: &ToolContext,
        input: Vec<Message>,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<String, TurnFailure>;
}

#[async_trait]
impl StepAgent for Agent {
    fn name(&self) -> &str {
        Agent::name(self)
    }

    async fn respond(
        &self,
        ctx: &ToolContext,
        input: Vec<Message>,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<String, TurnFailure> {
        let reply = match events {
            Some(tx) => self.run_turn_with_events(ctx, input, cancel, tx).await?,
            None => self.run_turn(ctx, input, cancel).await?,
        };
        Ok(reply.text)
    }
}

/// One completed step turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step: Step,
    /// Number of invocations, retries included.
    pub attempts: usize,
    pub output: StepOutput,
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub records: Vec<StepRecord>,
    /// Step persisted at the end of the run.
    pub final_step: String,
    /// `false` when a step paused for more user input.
    pub finished: bool,
    pub macro_summary: Option<String>,
}

impl RunOutcome {
    pub fn visited(&self) -> Vec<Step> {
        self.records.iter().map(|r| r.step).collect()
    }

    /// Payload of the last step that ran, if any.
    pub fn last_payload(&self) -> Option<String> {
        self.records.last().map(|r| r.output.payload_text())
    }
}

/// Builds an [`Orchestrator`], checking every step has an agent.
pub struct OrchestratorBuilder {
    store: Arc<dyn SessionStore>,
    agents: HashMap<Step, Arc<dyn StepAgent>>,
    reflector: Option<Arc<dyn StepAgent>>,
    max_step_retries: usize,
    events: Option<mpsc::Sender<AgentEvent>>,
}

impl OrchestratorBuilder {
    pub fn step(mut self, step: Step, agent: Arc<dyn StepAgent>) -> Self {
        self.agents.insert(step, agent);
        self
    }

    pub fn reflector(mut self, agent: Arc<dyn StepAgent>) -> Self {
        self.reflector = Some(agent);
        self
    }

    pub fn max_step_retries(mut self, limit: usize) -> Self {
        self.max_step_retries = limit;
        self
    }

    pub fn events(mut self, tx: mpsc::Sender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Result<Orchestrator, FlowError> {
        if let Some(missing) = Step::ORDER.iter().find(|s| !self.agents.contains_key(s)) {
            return Err(FlowError::MissingAgent(missing.name().to_string()));
        }
        let reflector = self
            .reflector
            .ok_or_else(|| FlowError::MissingAgent(MACRO_AGENT.to_string()))?;
        Ok(Orchestrator {
            store: self.store,
            agents: self.agents,
            reflector,
            max_step_retries: self.max_step_retries,
            events: self.events,
        })
    }
}

/// Fixed-topology step flow persisted through a [`SessionStore`].
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    agents: HashMap<Step, Arc<dyn StepAgent>>,
    reflector: Arc<dyn StepAgent>,
    max_step_retries: usize,
    events: Option<mpsc::Sender<AgentEvent>>,
}

impl Orchestrator {
    pub fn builder(store: Arc<dyn SessionStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            agents: HashMap::new(),
            reflector: None,
            max_step_retries: DEFAULT_MAX_STEP_RETRIES,
            events: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Step a run for `session_id` would start at. `None` means the session
    /// already finished.
    pub async fn current_step(&self, session_id: &SessionId) -> Result<Option<Step>, FlowError> {
        match self.store.get_step(session_id).await? {
            None => Ok(Some(Step::first())),
            Some(stored) => Ok(stored.parse::<Step>().ok()),
        }
    }

    /// Drives the session from its persisted step until it pauses or finishes.
    pub async fn run(
        &self,
        session_id: &SessionId,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, FlowError> {
        let stored = self.store.get_step(session_id).await?;
        let mut step = match stored.as_deref() {
            None => Step::first(),
            Some(name) => match name.parse::<Step>() {
                Ok(step) => step,
                Err(_) => {
                    info!(session_id = %session_id, step = name, "Session already finished");
                    return Ok(RunOutcome {
                        session_id: session_id.clone(),
                        records: Vec::new(),
                        final_step: name.to_string(),
                        finished: true,
                        macro_summary: None,
                    });
                }
            },
        };
        info!(session_id = %session_id, step = %step, "Flow run started");

        let mut records = Vec::new();
        let mut input = vec![Message::user(user_message)];

        loop {
            let record = match self.run_step(session_id, step, input, cancel).await {
                Ok(record) => record,
                Err(err) => return Err(self.keep_position(session_id, step, err).await),
            };
            let output = record.output.clone();
            records.push(record);

            if output.next_step.as_deref() == Some(step.name()) && !step.is_terminal() {
                debug!(session_id = %session_id, step = %step, "Step is waiting for user input");
                self.store.set_step(session_id, step.name()).await?;
                return Ok(RunOutcome {
                    session_id: session_id.clone(),
                    records,
                    final_step: step.name().to_string(),
                    finished: false,
                    macro_summary: None,
                });
            }

            let next = match step.next() {
                Some(Step::Vision) if step == Step::Gap && output.reports_no_gaps() => {
                    info!(session_id = %session_id, "No gaps reported, skipping vision");
                    Some(Step::Reflect)
                }
                other => other,
            };

            let Some(next) = next else {
                let terminal = output
                    .next_step
                    .clone()
                    .filter(|hint| hint.parse::<Step>().is_err())
                    .unwrap_or_else(|| COMPLETE.to_string());
                // The session only counts as finished once its summary exists.
                let summary = match self.macro_reflect(session_id, &records, cancel).await {
                    Ok(summary) => summary,
                    Err(err) => return Err(self.keep_position(session_id, step, err).await),
                };
                self.store.set_step(session_id, &terminal).await?;
                info!(session_id = %session_id, final_step = %terminal, "Flow finished");
                return Ok(RunOutcome {
                    session_id: session_id.clone(),
                    records,
                    final_step: terminal,
                    finished: true,
                    macro_summary: Some(summary),
                });
            };

            input = vec![Message::user(format!(
                "Output of the {step} step:\n{}",
                output.payload_text()
            ))];
            step = next;
        }
    }

    /// Persists `step` so the next run resumes there, then hands back `err`.
    /// A failing write is logged; the step error is what the caller sees.
    async fn keep_position(&self, session_id: &SessionId, step: Step, err: FlowError) -> FlowError {
        if let Err(store_err) = self.store.set_step(session_id, step.name()).await {
            error!(
                session_id = %session_id,
                step = %step,
                error = %store_err,
                "Failed to persist step after failure"
            );
        }
        err
    }

    /// Runs one step, re-invoking the same agent while it requests a retry.
    async fn run_step(
        &self,
        session_id: &SessionId,
        step: Step,
        input: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<StepRecord, FlowError> {
        let agent = self
            .agents
            .get(&step)
            .ok_or_else(|| FlowError::MissingAgent(step.name().to_string()))?;
        let ctx = ToolContext::for_session(session_id.clone(), step.name()).with_store(Arc::clone(&self.store));

        let mut attempts = 0;
        let mut turn_input = input;
        loop {
            attempts += 1;
            debug!(session_id = %session_id, step = %step, agent = agent.name(), attempt = attempts, "Invoking step agent");
            let text = agent
                .respond(&ctx, turn_input, cancel, self.events.clone())
                .await
                .map_err(|failure| FlowError::StepFailed {
                    step: step.name().to_string(),
                    error: failure.payload,
                })?;
            let output = StepOutput::parse(&text);

            let retry = output.retry_requested().cloned();
            let Some(reflexion) = retry else {
                return Ok(StepRecord { step, attempts, output });
            };
            if attempts > self.max_step_retries {
                warn!(session_id = %session_id, step = %step, limit = self.max_step_retries, "Retry limit reached");
                return Err(FlowError::RetryLimit {
                    step: step.name().to_string(),
                    limit: self.max_step_retries,
                });
            }

            warn!(session_id = %session_id, step = %step, reason = %reflexion.reason, "Step requested retry");
            self.store
                .append_reflection(session_id, step.name(), ReflectionKind::Micro, &reflexion.reason)
                .await?;

            let mut retry_prompt = format!("Retry requested: {}", reflexion.reason);
            if let Some(action) = reflexion.next_action.as_deref().filter(|a| !a.is_empty()) {
                retry_prompt.push_str(&format!("\nNext action: {action}"));
            }
            turn_input = vec![Message::user(retry_prompt)];
        }
    }

    /// Summarizes the whole session once and logs it as a macro entry.
    async fn macro_reflect(
        &self,
        session_id: &SessionId,
        records: &[StepRecord],
        cancel: &CancellationToken,
    ) -> Result<String, FlowError> {
        let state = self.store.load_state(session_id).await?;
        let mut transcript = String::from("Summarize this session.\n");
        for record in records {
            transcript.push_str(&format!("\n[{}] {}", record.step, record.output.payload_text()));
        }
        for note in &state.notes {
            transcript.push_str(&format!("\nnote ({}): {}", note.step, note.payload));
        }
        for entry in state.reflections_of(ReflectionKind::Micro) {
            transcript.push_str(&format!("\nretry ({}): {}", entry.step, entry.content));
        }

        let ctx = ToolContext::for_session(session_id.clone(), MACRO_AGENT).with_store(Arc::clone(&self.store));
        let summary = self
            .reflector
            .respond(&ctx, vec![Message::user(transcript)], cancel, self.events.clone())
            .await
            .map_err(|failure| FlowError::StepFailed {
                step: MACRO_AGENT.to_string(),
                error: failure.payload,
            })?;

        self.store
            .append_reflection(session_id, Step::Reflect.name(), ReflectionKind::Macro, &summary)
            .await?;
        Ok(summary)
    }
}
