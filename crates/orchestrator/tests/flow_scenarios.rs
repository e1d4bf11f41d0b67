use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent::{Agent, AgentConfig, PolicyGuardrail, ScriptedProvider, ToolRegistry, TurnFailure};
use async_trait::async_trait;
use orchestrator::{
    InMemorySessionStore, Orchestrator, SqliteSessionStore, Step, StepAgent, COMPLETE,
};
use proto::{
    AgentEvent, ErrorPayload, FlowError, Message, ReflectionKind, Role, SessionId, SessionState,
    SessionStore, StoreError,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tools::{SaveNoteTool, ToolContext};

type CallLog = Arc<Mutex<Vec<String>>>;

/// Step agent that replays canned replies and records every invocation.
struct ScriptedStep {
    name: String,
    replies: Mutex<VecDeque<Result<String, ErrorPayload>>>,
    fallback: String,
    calls: AtomicUsize,
    log: CallLog,
}

impl ScriptedStep {
    fn new(name: &str, fallback: Value, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            replies: Mutex::new(VecDeque::new()),
            fallback: match fallback {
                Value::String(text) => text,
                other => other.to_string(),
            },
            calls: AtomicUsize::new(0),
            log: Arc::clone(log),
        })
    }

    fn then(self: Arc<Self>, reply: Value) -> Arc<Self> {
        self.replies.lock().expect("replies").push_back(Ok(reply.to_string()));
        self
    }

    fn then_fail(self: Arc<Self>, payload: ErrorPayload) -> Arc<Self> {
        self.replies.lock().expect("replies").push_back(Err(payload));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAgent for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn respond(
        &self,
        _ctx: &ToolContext,
        _input: Vec<Message>,
        _cancel: &CancellationToken,
        _events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<String, TurnFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().expect("log").push(self.name.clone());
        let next = self.replies.lock().expect("replies").pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(payload)) => Err(TurnFailure {
                agent: self.name.clone(),
                payload,
            }),
            None => Ok(self.fallback.clone()),
        }
    }
}

struct Fixture {
    log: CallLog,
    agents: Vec<(Step, Arc<ScriptedStep>)>,
    reflector: Arc<ScriptedStep>,
}

impl Fixture {
    fn new() -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let agents = Step::ORDER
            .iter()
            .map(|step| {
                let reply = match step {
                    Step::Gap => json!({"payload": "gaps found", "gaps": ["public speaking"]}),
                    Step::Reflect => json!({"payload": "wrap up", "next_step": COMPLETE}),
                    other => json!({"payload": format!("{other} done")}),
                };
                (*step, ScriptedStep::new(step.name(), reply, &log))
            })
            .collect();
        let reflector = ScriptedStep::new("macro", json!("session summary"), &log);
        Self { log, agents, reflector }
    }

    fn agent(&self, step: Step) -> &Arc<ScriptedStep> {
        &self
            .agents
            .iter()
            .find(|(s, _)| *s == step)
            .expect("agent for step")
            .1
    }

    fn replace(&mut self, step: Step, agent: Arc<ScriptedStep>) {
        if let Some(slot) = self.agents.iter_mut().find(|(s, _)| *s == step) {
            slot.1 = agent;
        }
    }

    fn orchestrator(&self, store: Arc<dyn SessionStore>, max_retries: usize) -> Orchestrator {
        let mut builder = Orchestrator::builder(store).max_step_retries(max_retries);
        for (step, agent) in &self.agents {
            builder = builder.step(*step, agent.clone() as Arc<dyn StepAgent>);
        }
        builder
            .reflector(self.reflector.clone() as Arc<dyn StepAgent>)
            .build()
            .expect("all steps bound")
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().expect("log").clone()
    }
}

#[tokio::test]
async fn linear_flow_visits_every_step_once() {
    let fixture = Fixture::new();
    let store = Arc::new(InMemorySessionStore::new());
    let flow = fixture.orchestrator(store.clone(), 3);
    let sid = SessionId::from("linear");

    let outcome = flow
        .run(&sid, "I want to become a staff engineer", &CancellationToken::new())
        .await
        .expect("flow");

    assert_eq!(outcome.visited(), Step::ORDER.to_vec());
    assert_eq!(
        fixture.calls(),
        vec!["future", "motivation", "history", "gap", "vision", "reflect", "macro"]
    );
    for step in Step::ORDER {
        assert_eq!(fixture.agent(step).calls(), 1, "{step} invoked once");
    }
    assert!(outcome.finished);
    assert_eq!(outcome.final_step, COMPLETE);
    assert_eq!(store.get_step(&sid).await.expect("step").as_deref(), Some(COMPLETE));

    let state = store.load_state(&sid).await.expect("state");
    assert_eq!(state.reflections_of(ReflectionKind::Micro).count(), 0);
    let macros: Vec<_> = state.reflections_of(ReflectionKind::Macro).collect();
    assert_eq!(macros.len(), 1);
    assert_eq!(macros[0].content, "session summary");
    assert_eq!(outcome.macro_summary.as_deref(), Some("session summary"));
}

#[tokio::test]
async fn empty_gap_list_skips_vision() {
    let mut fixture = Fixture::new();
    let log = fixture.log.clone();
    fixture.replace(
        Step::Gap,
        ScriptedStep::new("gap", json!({"payload": "nothing missing", "gaps": []}), &log),
    );
    let flow = fixture.orchestrator(Arc::new(InMemorySessionStore::new()), 3);

    let outcome = flow
        .run(&SessionId::from("skip"), "hello", &CancellationToken::new())
        .await
        .expect("flow");

    assert_eq!(fixture.agent(Step::Vision).calls(), 0);
    assert_eq!(
        outcome.visited(),
        vec![Step::Future, Step::Motivation, Step::History, Step::Gap, Step::Reflect]
    );
    let calls = fixture.calls();
    let gap_at = calls.iter().position(|c| c == "gap").expect("gap ran");
    assert_eq!(calls[gap_at + 1], "reflect");
}

#[tokio::test]
async fn retry_reinvokes_same_step_and_logs_one_micro_entry() {
    let mut fixture = Fixture::new();
    let log = fixture.log.clone();
    let gap = ScriptedStep::new("gap", json!({"payload": "gaps", "gaps": ["x"]}), &log).then(json!({
        "payload": "not sure yet",
        "reflexion": {"status": "retry", "reason": "need_retry", "next_action": "ask for detail"}
    }));
    fixture.replace(Step::Gap, gap);
    let store = Arc::new(InMemorySessionStore::new());
    let flow = fixture.orchestrator(store.clone(), 3);
    let sid = SessionId::from("retry");

    let outcome = flow.run(&sid, "hello", &CancellationToken::new()).await.expect("flow");

    assert_eq!(fixture.agent(Step::Gap).calls(), 2);
    let calls = fixture.calls();
    assert_eq!(&calls[3..5], &["gap".to_string(), "gap".to_string()]);
    let gap_record = outcome
        .records
        .iter()
        .find(|r| r.step == Step::Gap)
        .expect("gap record");
    assert_eq!(gap_record.attempts, 2);

    let state = store.load_state(&sid).await.expect("state");
    let entries: Vec<_> = state
        .reflections
        .iter()
        .map(|r| (r.step.as_str(), r.kind, r.content.as_str()))
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0], ("gap", ReflectionKind::Micro, "need_retry"));
    assert_eq!(entries[1].1, ReflectionKind::Macro);
}

#[tokio::test]
async fn retries_are_bounded() {
    let mut fixture = Fixture::new();
    let log = fixture.log.clone();
    fixture.replace(
        Step::Future,
        ScriptedStep::new(
            "future",
            json!({"payload": "again", "reflexion": {"status": "retry", "reason": "vague"}}),
            &log,
        ),
    );
    let store = Arc::new(InMemorySessionStore::new());
    let flow = fixture.orchestrator(store.clone(), 2);
    let sid = SessionId::from("bounded");

    let err = flow
        .run(&sid, "hello", &CancellationToken::new())
        .await
        .expect_err("retry limit");

    match &err {
        FlowError::RetryLimit { step, limit } => {
            assert_eq!(step, "future");
            assert_eq!(*limit, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.payload().code, "retry_limit");
    assert_eq!(fixture.agent(Step::Future).calls(), 3);
    let state = store.load_state(&sid).await.expect("state");
    assert_eq!(state.reflections_of(ReflectionKind::Micro).count(), 2);
    assert_eq!(state.current_step.as_deref(), Some("future"));
}

#[tokio::test]
async fn step_waiting_for_input_pauses_and_resumes() {
    let mut fixture = Fixture::new();
    let log = fixture.log.clone();
    let history = ScriptedStep::new("history", json!({"payload": "history done"}), &log)
        .then(json!({"payload": "Tell me about your last project", "next_step": "history"}));
    fixture.replace(Step::History, history);
    let store = Arc::new(InMemorySessionStore::new());
    let flow = fixture.orchestrator(store.clone(), 3);
    let sid = SessionId::from("pause");
    let cancel = CancellationToken::new();

    let first = flow.run(&sid, "start", &cancel).await.expect("first run");
    assert!(!first.finished);
    assert_eq!(first.final_step, "history");
    assert_eq!(first.last_payload().as_deref(), Some("Tell me about your last project"));
    assert_eq!(flow.current_step(&sid).await.expect("step"), Some(Step::History));

    let second = flow.run(&sid, "I shipped a compiler", &cancel).await.expect("second run");
    assert!(second.finished);
    assert_eq!(second.visited().first(), Some(&Step::History));
    assert_eq!(fixture.agent(Step::Future).calls(), 1);
    assert_eq!(fixture.agent(Step::History).calls(), 2);

    let third = flow.run(&sid, "anything else?", &cancel).await.expect("finished session");
    assert!(third.finished);
    assert!(third.records.is_empty());
    assert_eq!(third.final_step, COMPLETE);
    assert_eq!(flow.current_step(&sid).await.expect("step"), None);
}

#[tokio::test]
async fn step_failure_is_structured_and_keeps_position() {
    let mut fixture = Fixture::new();
    let log = fixture.log.clone();
    let motivation = ScriptedStep::new("motivation", json!({"payload": "ok"}), &log)
        .then_fail(ErrorPayload::new("timeout", "provider timed out"));
    fixture.replace(Step::Motivation, motivation);
    let store = Arc::new(InMemorySessionStore::new());
    let flow = fixture.orchestrator(store.clone(), 3);
    let sid = SessionId::from("failing");

    let err = flow
        .run(&sid, "hi", &CancellationToken::new())
        .await
        .expect_err("step failure");
    let payload = err.payload();
    assert_eq!(payload.code, "timeout");
    assert_eq!(payload.details["step"], "motivation");
    assert_eq!(store.get_step(&sid).await.expect("step").as_deref(), Some("motivation"));

    let resumed = flow.run(&sid, "retrying", &CancellationToken::new()).await.expect("resume");
    assert_eq!(resumed.visited().first(), Some(&Step::Motivation));
    assert_eq!(fixture.agent(Step::Future).calls(), 1);
}

#[tokio::test]
async fn builder_requires_every_step_and_a_reflector() {
    let fixture = Fixture::new();
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());

    let partial = Orchestrator::builder(store.clone())
        .step(Step::Future, fixture.agent(Step::Future).clone() as Arc<dyn StepAgent>)
        .build();
    assert!(matches!(partial, Err(FlowError::MissingAgent(step)) if step == "motivation"));

    let mut builder = Orchestrator::builder(store);
    for step in Step::ORDER {
        builder = builder.step(step, fixture.agent(step).clone() as Arc<dyn StepAgent>);
    }
    assert!(matches!(builder.build(), Err(FlowError::MissingAgent(name)) if name == "macro_reflection"));
}

fn real_agent(step: Step, llm: Arc<ScriptedProvider>, guardrail: PolicyGuardrail) -> Arc<Agent> {
    let mut registry = ToolRegistry::new();
    registry.register(SaveNoteTool::new());
    Arc::new(
        Agent::new(
            AgentConfig::new(step.name(), step.default_instructions(), "mock-model"),
            llm,
            Arc::new(registry),
        )
        .with_guardrail(Arc::new(guardrail)),
    )
}

/// Flow over `store` where `step` is served by `real` and every other step is scripted.
fn flow_over(
    fixture: &Fixture,
    store: Arc<dyn SessionStore>,
    step: Step,
    real: Arc<Agent>,
) -> Orchestrator {
    let mut builder = Orchestrator::builder(store).max_step_retries(3);
    for (s, agent) in &fixture.agents {
        let bound: Arc<dyn StepAgent> = if *s == step {
            real.clone() as Arc<dyn StepAgent>
        } else {
            agent.clone() as Arc<dyn StepAgent>
        };
        builder = builder.step(*s, bound);
    }
    builder
        .reflector(fixture.reflector.clone() as Arc<dyn StepAgent>)
        .build()
        .expect("flow")
}

fn agent_step(
    fixture: &mut Fixture,
    step: Step,
    llm: Arc<ScriptedProvider>,
    guardrail: PolicyGuardrail,
) -> Orchestrator {
    let flow = flow_over(
        fixture,
        Arc::new(InMemorySessionStore::new()),
        step,
        real_agent(step, llm, guardrail),
    );
    fixture.agents.retain(|(s, _)| *s != step);
    flow
}

fn request_texts(llm: &ScriptedProvider, index: usize) -> Vec<String> {
    llm.requests()[index]
        .messages
        .iter()
        .map(|m| m.text().to_string())
        .collect()
}

#[tokio::test]
async fn denied_tool_is_reported_to_the_model_and_flow_continues() {
    let mut fixture = Fixture::new();
    let llm = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_round("call_1", "save_note", r#"{"key":"goal","value":"staff"}"#),
        ScriptedProvider::text_round(json!({"payload": "noted without saving"}).to_string()),
    ]));
    let flow = agent_step(
        &mut fixture,
        Step::Future,
        llm.clone(),
        PolicyGuardrail::new().deny_tool("save_note"),
    );
    let sid = SessionId::from("denied");

    let outcome = flow.run(&sid, "hello", &CancellationToken::new()).await.expect("flow");

    assert!(outcome.finished);
    assert_eq!(outcome.records[0].output.payload, json!("noted without saving"));
    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let tool_msg = requests[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result message");
    let body: Value = serde_json::from_str(tool_msg.text()).expect("json");
    assert_eq!(body["error"]["code"], "tool_denied");
    assert_eq!(body["error"]["details"]["tool"], "save_note");

    let state = flow.store().load_state(&sid).await.expect("state");
    assert!(state.notes.is_empty());
}

#[tokio::test]
async fn allowed_tool_writes_note_for_current_step() {
    let mut fixture = Fixture::new();
    let llm = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_round("call_1", "save_note", r#"{"key":"why","value":"autonomy"}"#),
        ScriptedProvider::text_round(json!({"payload": "saved"}).to_string()),
    ]));
    let flow = agent_step(&mut fixture, Step::Motivation, llm, PolicyGuardrail::new());
    let sid = SessionId::from("notes");

    flow.run(&sid, "hello", &CancellationToken::new()).await.expect("flow");

    let state = flow.store().load_state(&sid).await.expect("state");
    let notes: Vec<_> = state.notes_for("motivation").collect();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].payload, json!({"key": "why", "value": "autonomy"}));
}

#[tokio::test]
async fn sqlite_store_backs_a_full_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteSessionStore::open(&dir.path().join("flow.db").to_string_lossy())
        .await
        .expect("open store");
    let fixture = Fixture::new();
    let flow = fixture.orchestrator(Arc::new(store), 3);
    let sid = SessionId::from("sqlite-run");

    let outcome = flow.run(&sid, "hello", &CancellationToken::new()).await.expect("flow");

    assert!(outcome.finished);
    let state = flow.store().load_state(&sid).await.expect("state");
    assert_eq!(state.current_step.as_deref(), Some(COMPLETE));
    assert_eq!(state.reflections_of(ReflectionKind::Macro).count(), 1);
}

#[tokio::test]
async fn sessions_on_one_flow_do_not_share_agent_memory() {
    let fixture = Fixture::new();
    let llm = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::text_round(json!({"payload": "alice wants to lead"}).to_string()),
        ScriptedProvider::text_round(json!({"payload": "bob wants to teach"}).to_string()),
    ]));
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let flow = flow_over(
        &fixture,
        store,
        Step::Future,
        real_agent(Step::Future, llm.clone(), PolicyGuardrail::new()),
    );
    let cancel = CancellationToken::new();

    flow.run(&SessionId::from("alice"), "alice: I secretly want to quit", &cancel)
        .await
        .expect("alice run");
    flow.run(&SessionId::from("bob"), "bob: I like mentoring", &cancel)
        .await
        .expect("bob run");

    let bob_request = request_texts(&llm, 1);
    assert!(
        bob_request.iter().all(|text| !text.contains("alice")),
        "bob saw alice's turn: {bob_request:?}"
    );
    assert_eq!(bob_request.last().map(String::as_str), Some("bob: I like mentoring"));
}

#[tokio::test]
async fn resumed_step_remembers_its_earlier_turn_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("resume.db").to_string_lossy().into_owned();
    let sid = SessionId::from("restart");
    let fixture = Fixture::new();

    let first_llm = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_round(
        json!({"payload": "Where do you see yourself in five years?", "next_step": "future"})
            .to_string(),
    )]));
    let store = SqliteSessionStore::open(&path).await.expect("open store");
    let first = flow_over(
        &fixture,
        Arc::new(store),
        Step::Future,
        real_agent(Step::Future, first_llm, PolicyGuardrail::new()),
    );
    let paused = first
        .run(&sid, "I want to grow", &CancellationToken::new())
        .await
        .expect("first run");
    assert!(!paused.finished);
    assert_eq!(paused.final_step, "future");
    drop(first);

    let second_llm = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_round(
        json!({"payload": "a staff role it is"}).to_string(),
    )]));
    let reopened = SqliteSessionStore::open(&path).await.expect("reopen store");
    let second = flow_over(
        &fixture,
        Arc::new(reopened),
        Step::Future,
        real_agent(Step::Future, second_llm.clone(), PolicyGuardrail::new()),
    );
    let resumed = second
        .run(&sid, "a staff engineer", &CancellationToken::new())
        .await
        .expect("resumed run");

    assert!(resumed.finished);
    assert_eq!(resumed.visited().first(), Some(&Step::Future));
    let texts = request_texts(&second_llm, 0);
    assert_eq!(texts.len(), 4, "system, prior question and answer, new input: {texts:?}");
    assert_eq!(texts[1], "I want to grow");
    assert!(texts[2].contains("Where do you see yourself in five years?"));
    assert_eq!(texts[3], "a staff engineer");
}

#[tokio::test]
async fn failed_summary_keeps_session_open_at_reflect() {
    let mut fixture = Fixture::new();
    fixture.reflector = ScriptedStep::new("macro", json!("session summary"), &fixture.log)
        .then_fail(ErrorPayload::new("timeout", "provider timed out"));
    let store = Arc::new(InMemorySessionStore::new());
    let flow = fixture.orchestrator(store.clone(), 3);
    let sid = SessionId::from("summary-timeout");

    let err = flow
        .run(&sid, "hello", &CancellationToken::new())
        .await
        .expect_err("reflector failure");
    assert_eq!(err.payload().code, "timeout");
    assert_eq!(store.get_step(&sid).await.expect("step").as_deref(), Some("reflect"));
    let state = store.load_state(&sid).await.expect("state");
    assert_eq!(state.reflections_of(ReflectionKind::Macro).count(), 0);

    let rerun = flow.run(&sid, "try again", &CancellationToken::new()).await.expect("rerun");
    assert!(rerun.finished);
    assert_eq!(rerun.visited(), vec![Step::Reflect]);
    assert_eq!(rerun.macro_summary.as_deref(), Some("session summary"));
    assert_eq!(store.get_step(&sid).await.expect("step").as_deref(), Some(COMPLETE));
    let state = store.load_state(&sid).await.expect("state");
    assert_eq!(state.reflections_of(ReflectionKind::Macro).count(), 1);
}

/// Store whose step writes always fail.
struct StepWriteFails(InMemorySessionStore);

#[async_trait]
impl SessionStore for StepWriteFails {
    async fn get_step(&self, session_id: &SessionId) -> Result<Option<String>, StoreError> {
        self.0.get_step(session_id).await
    }

    async fn set_step(&self, _session_id: &SessionId, _step: &str) -> Result<(), StoreError> {
        Err(StoreError::Sqlx("database is locked".to_string()))
    }

    async fn append_note(
        &self,
        session_id: &SessionId,
        step: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.0.append_note(session_id, step, payload).await
    }

    async fn append_reflection(
        &self,
        session_id: &SessionId,
        step: &str,
        kind: ReflectionKind,
        content: &str,
    ) -> Result<(), StoreError> {
        self.0.append_reflection(session_id, step, kind, content).await
    }

    async fn load_state(&self, session_id: &SessionId) -> Result<SessionState, StoreError> {
        self.0.load_state(session_id).await
    }
}

#[tokio::test]
async fn step_error_survives_a_failing_position_write() {
    let mut fixture = Fixture::new();
    let log = fixture.log.clone();
    fixture.replace(
        Step::Motivation,
        ScriptedStep::new("motivation", json!({"payload": "ok"}), &log)
            .then_fail(ErrorPayload::new("timeout", "provider timed out")),
    );
    let flow = fixture.orchestrator(Arc::new(StepWriteFails(InMemorySessionStore::new())), 3);

    let err = flow
        .run(&SessionId::from("locked"), "hi", &CancellationToken::new())
        .await
        .expect_err("step failure");

    assert!(matches!(err, FlowError::StepFailed { ref step, .. } if step == "motivation"));
    assert_eq!(err.payload().code, "timeout");
}
