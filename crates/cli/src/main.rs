//! CLI entrypoint and subcommand orchestration.

mod config;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use agent::{
    Agent, AgentConfig, AnthropicProvider, GeminiProvider, Guardrail, LlmProvider, OpenAiProvider,
    ProviderSettings, ToolRegistry,
};
use clap::{Parser, Subcommand};
use orchestrator::{OUTPUT_CONTRACT, Orchestrator, RunOutcome, Step, StepAgent};
use proto::{AgentEvent, ErrorPayload, FlowError, SessionStore};
use tokio::sync::mpsc;
use tools::{ReadNotesTool, SaveNoteTool, count_characters_tool};

use crate::config::{Config, ProviderPreset};

#[cfg(not(test))]
use orchestrator::SqliteSessionStore;
#[cfg(not(test))]
use proto::{ReflectionKind, SessionId};
#[cfg(not(test))]
use tokio_util::sync::CancellationToken;
#[cfg(not(test))]
use tracing::{info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const REFLECTOR_NAME: &str = "macro_reflection";
const REFLECTOR_INSTRUCTIONS: &str = "You review a finished self-development session. \
Summarize the user's goal, the motivations and history uncovered, the gaps found, \
the vision agreed on, and any retries that happened. Answer in plain prose.";

/// Top-level command-line arguments for the selfcraft application.
#[derive(Parser)]
#[command(name = "selfcraft")]
#[command(about = "Guided self-development sessions driven by LLM step agents", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.selfcraft/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands available in the application.
#[derive(Subcommand)]
enum Commands {
    /// Send one message to a session and advance its step flow
    Run {
        /// Session to continue. A new one is created when omitted.
        #[arg(short = 's', long)]
        session: Option<String>,

        /// Message for the current step
        message: String,
    },

    /// Show the persisted state of a session
    Status {
        #[arg(short = 's', long)]
        session: String,
    },

    /// Print the JSON schema of every registered tool
    Tools,
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // When --debug is passed, write debug-level logs to ~/.selfcraft/logs/debug.YYYY-MM-DD.log
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let log_dir = std::path::PathBuf::from(home).join(".selfcraft").join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new(
                "debug,hyper_util=info,rustls=info,reqwest=info,sqlx=info",
            ));
        tracing_subscriber::registry().with(console).with(file).init();

        let cmd_label = match &cli.command {
            Commands::Run { .. } => "run",
            Commands::Status { .. } => "status",
            Commands::Tools => "tools",
        };
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cmd_label,
            log_level = %cli.log_level,
            "========== selfcraft session start =========="
        );
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Failed to load config ({e}), using defaults");
        Config::default()
    });

    match cli.command {
        Commands::Run { session, message } => cmd_run(config, session, message).await,
        Commands::Status { session } => cmd_status(config, session).await,
        Commands::Tools => cmd_tools(),
    }
}

#[cfg(not(test))]
/// Runs one message through the session's step flow and prints the outcome.
async fn cmd_run(config: Config, session: Option<String>, message: String) -> anyhow::Result<()> {
    let store = SqliteSessionStore::open(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("DB error: {e}"))?;
    let store: Arc<dyn SessionStore> = Arc::new(store);

    let settings = config.provider_settings();
    if settings.api_key.is_empty() {
        warn!(
            "No API key configured. Set SELFCRAFT_API_KEY or {}.",
            config.agent.provider.api_key_env()
        );
    }
    let llm = build_provider(config.agent.provider, settings);

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = render_event(&event) {
                eprintln!("{line}");
            }
        }
    });

    let orchestrator = build_orchestrator(&config, llm, Arc::clone(&store), Some(tx))?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let session_id = session.map(|s| SessionId::from(s.as_str())).unwrap_or_default();
    info!(session_id = %session_id, "Running session");
    println!("{}", format_run_header(&session_id, &message));

    let result = orchestrator.run(&session_id, &message, &cancel).await;
    drop(orchestrator);
    printer.await.ok();

    match result {
        Ok(outcome) => {
            println!("{}", format_outcome(&outcome));
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", format_error(&e.payload()));
            std::process::exit(1);
        }
    }
}

#[cfg(not(test))]
/// Prints the persisted step, notes, and reflections of one session.
async fn cmd_status(config: Config, session: String) -> anyhow::Result<()> {
    let store = SqliteSessionStore::open(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("DB error: {e}"))?;
    let state = store.load_state(&SessionId::from(session.as_str())).await?;

    let step = match state.current_step.as_deref() {
        None => "not started".to_string(),
        Some(name) if name.parse::<Step>().is_ok() => name.to_string(),
        Some(name) => format!("finished ({name})"),
    };
    println!("Session: {}", state.session_id);
    println!("Step:    {step}");
    println!("Notes:   {}", state.notes.len());
    for note in &state.notes {
        println!("  [{}] {}", note.step, note.payload);
    }
    for entry in state.reflections_of(ReflectionKind::Micro) {
        println!("Retry [{}]: {}", entry.step, entry.content);
    }
    for entry in state.reflections_of(ReflectionKind::Macro) {
        println!("Summary: {}", entry.content);
    }
    Ok(())
}

#[cfg(not(test))]
fn cmd_tools() -> anyhow::Result<()> {
    let registry = build_tool_registry();
    println!("{}", serde_json::to_string_pretty(&registry.schemas())?);
    Ok(())
}

/// Builds an LLM provider instance for the given preset.
fn build_provider(preset: ProviderPreset, settings: ProviderSettings) -> Arc<dyn LlmProvider> {
    match preset {
        ProviderPreset::OpenAi => Arc::new(OpenAiProvider::new(settings)),
        ProviderPreset::Anthropic => Arc::new(AnthropicProvider::new(settings)),
        ProviderPreset::Gemini => Arc::new(GeminiProvider::new(settings)),
    }
}

/// Tools every step agent can call.
fn build_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(SaveNoteTool::new());
    registry.register(ReadNotesTool::new());
    registry.register(count_characters_tool());
    registry
}

fn agent_config(config: &Config, name: &str, instructions: String) -> AgentConfig {
    let mut agent_config = AgentConfig::new(name, instructions, config.agent.effective_model());
    agent_config.max_tool_rounds = config.agent.max_tool_rounds;
    agent_config.memory_window = config.agent.memory_window;
    agent_config.memory_max_items = config.agent.memory_max_items;
    agent_config.stream = config.agent.stream;
    agent_config.tool_denial = config.agent.tool_denial;
    agent_config
}

/// Wires one agent per step plus the macro reflector around a shared provider.
fn build_orchestrator(
    config: &Config,
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn SessionStore>,
    events: Option<mpsc::Sender<AgentEvent>>,
) -> Result<Orchestrator, FlowError> {
    let registry = Arc::new(build_tool_registry());
    let guardrail: Arc<dyn Guardrail> = Arc::new(config.guardrail.build());

    let mut builder = Orchestrator::builder(store).max_step_retries(config.flow.max_step_retries);
    for step in Step::ORDER {
        let instructions = format!("{}\n\n{}", step.default_instructions(), OUTPUT_CONTRACT);
        let agent = Agent::new(
            agent_config(config, step.name(), instructions),
            Arc::clone(&llm),
            Arc::clone(&registry),
        )
        .with_guardrail(Arc::clone(&guardrail));
        builder = builder.step(step, Arc::new(agent) as Arc<dyn StepAgent>);
    }

    let reflector = Agent::new(
        agent_config(config, REFLECTOR_NAME, REFLECTOR_INSTRUCTIONS.to_string()),
        llm,
        registry,
    )
    .with_guardrail(guardrail);
    builder = builder.reflector(Arc::new(reflector));
    if let Some(tx) = events {
        builder = builder.events(tx);
    }
    builder.build()
}

/// One-line progress rendering. Text deltas are left to the final output.
fn render_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::ProviderRound { agent, round } if *round > 0 => {
            Some(format!("[{agent}] round {}", round + 1))
        }
        AgentEvent::ToolCallStarted {
            tool_name,
            arguments,
            ..
        } => Some(format!("  -> {tool_name} {arguments}")),
        AgentEvent::ToolCallFinished {
            tool_name,
            output,
            is_error,
            ..
        } => {
            let status = if *is_error { "error" } else { "ok" };
            Some(format!("  <- {tool_name} [{status}] {output}"))
        }
        _ => None,
    }
}

fn format_run_header(session_id: &impl std::fmt::Display, message: &str) -> String {
    format!("Session {session_id}: {message}")
}

fn format_outcome(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    for record in &outcome.records {
        let retries = record.attempts.saturating_sub(1);
        if retries > 0 {
            out.push_str(&format!("[{}] (retried {retries}x)\n", record.step));
        } else {
            out.push_str(&format!("[{}]\n", record.step));
        }
        out.push_str(&record.output.payload_text());
        out.push('\n');
    }
    if outcome.finished {
        out.push_str(&format!("Session finished ({})", outcome.final_step));
        if let Some(summary) = &outcome.macro_summary {
            out.push_str(&format!("\n\nSummary:\n{summary}"));
        }
    } else {
        out.push_str(&format!("Waiting for your reply at step {}", outcome.final_step));
    }
    out
}

fn format_error(payload: &ErrorPayload) -> String {
    serde_json::to_string_pretty(&serde_json::json!({ "error": payload }))
        .unwrap_or_else(|_| payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent::ScriptedProvider;
    use orchestrator::InMemorySessionStore;
    use proto::{ReflectionKind, SessionId};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn step_reply(payload: &str) -> String {
        json!({"payload": payload}).to_string()
    }

    #[test]
    fn tool_registry_exposes_note_and_text_tools() {
        let registry = build_tool_registry();
        let mut names = registry.tool_names();
        names.sort();
        assert_eq!(names, vec!["count_characters", "read_notes", "save_note"]);
        assert_eq!(registry.schemas().len(), 3);
    }

    #[test]
    fn build_provider_matches_preset() {
        for preset in ProviderPreset::all() {
            let provider = build_provider(*preset, ProviderSettings::new("key"));
            assert_eq!(provider.name(), preset.name());
        }
    }

    #[test]
    fn agent_config_copies_agent_section() {
        let mut cfg = Config::default();
        cfg.agent.max_tool_rounds = 3;
        cfg.agent.memory_window = 5;
        cfg.agent.stream = false;
        let agent_cfg = agent_config(&cfg, "gap", "find gaps".to_string());
        assert_eq!(agent_cfg.name, "gap");
        assert_eq!(agent_cfg.model, "gpt-4o");
        assert_eq!(agent_cfg.max_tool_rounds, 3);
        assert_eq!(agent_cfg.memory_window, 5);
        assert!(!agent_cfg.stream);
    }

    #[test]
    fn render_event_reports_tools_and_skips_text() {
        let started = AgentEvent::ToolCallStarted {
            call_id: "c1".to_string(),
            tool_name: "save_note".to_string(),
            arguments: json!({"key": "goal"}),
        };
        assert_eq!(
            render_event(&started).as_deref(),
            Some(r#"  -> save_note {"key":"goal"}"#)
        );
        let finished = AgentEvent::ToolCallFinished {
            call_id: "c1".to_string(),
            tool_name: "save_note".to_string(),
            output: json!({"error": {"code": "tool_denied"}}),
            is_error: true,
        };
        assert!(render_event(&finished).expect("line").contains("[error]"));
        let text = AgentEvent::TextDelta {
            agent: "future".to_string(),
            text: "hi".to_string(),
        };
        assert_eq!(render_event(&text), None);
        let first_round = AgentEvent::ProviderRound {
            agent: "future".to_string(),
            round: 0,
        };
        assert_eq!(render_event(&first_round), None);
    }

    #[test]
    fn format_error_wraps_payload() {
        let rendered = format_error(&ErrorPayload::new("retry_limit", "too many").with_detail("step", "gap"));
        let value: serde_json::Value = serde_json::from_str(&rendered).expect("json");
        assert_eq!(value["error"]["code"], "retry_limit");
        assert_eq!(value["error"]["details"]["step"], "gap");
    }

    #[test]
    fn format_run_header_embeds_session_and_message() {
        assert_eq!(format_run_header(&"s-1", "hello"), "Session s-1: hello");
    }

    #[tokio::test]
    async fn configured_orchestrator_runs_whole_flow() {
        let llm = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::text_round(step_reply("Become a speaker")),
            ScriptedProvider::text_round(step_reply("Wants to share ideas")),
            ScriptedProvider::text_round(step_reply("Gave one talk")),
            ScriptedProvider::text_round(json!({"payload": "Nerves", "gaps": ["stage fright"]}).to_string()),
            ScriptedProvider::text_round(step_reply("Keynote in a year")),
            ScriptedProvider::text_round(json!({"payload": "Done", "next_step": "complete"}).to_string()),
            ScriptedProvider::text_round("A focused session."),
        ]));
        let store = Arc::new(InMemorySessionStore::new());
        let (tx, mut rx) = mpsc::channel(64);

        let orchestrator = build_orchestrator(
            &Config::default(),
            llm.clone(),
            store.clone(),
            Some(tx),
        )
        .expect("orchestrator");
        let sid = SessionId::from("cli-flow");
        let outcome = orchestrator
            .run(&sid, "I want to speak publicly", &CancellationToken::new())
            .await
            .expect("run");

        assert!(outcome.finished);
        assert_eq!(outcome.visited(), Step::ORDER.to_vec());
        assert_eq!(outcome.final_step, "complete");
        assert_eq!(outcome.macro_summary.as_deref(), Some("A focused session."));
        assert!(format_outcome(&outcome).contains("Session finished (complete)"));

        let requests = llm.requests();
        assert_eq!(requests.len(), 7);
        assert!(requests[0].messages[0].text().contains("JSON"));
        assert_eq!(requests[0].tools.len(), 3);

        let state = store.load_state(&sid).await.expect("state");
        assert_eq!(state.reflections_of(ReflectionKind::Macro).count(), 1);

        drop(orchestrator);
        let mut rounds = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, AgentEvent::ProviderRound { .. }) {
                rounds += 1;
            }
        }
        assert_eq!(rounds, 7);
    }

    #[tokio::test]
    async fn denied_tool_from_config_reaches_the_model_as_error() {
        let llm = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::tool_round("call_0", "save_note", r#"{"key":"goal","value":"speak"}"#),
            ScriptedProvider::text_round(json!({"payload": "ok", "next_step": "future"}).to_string()),
        ]));
        let store = Arc::new(InMemorySessionStore::new());
        let mut cfg = Config::default();
        cfg.guardrail.denied_tools = vec!["save_note".to_string()];

        let orchestrator = build_orchestrator(&cfg, llm.clone(), store.clone(), None).expect("orchestrator");
        let sid = SessionId::from("cli-deny");
        let outcome = orchestrator
            .run(&sid, "hello", &CancellationToken::new())
            .await
            .expect("run");

        assert!(!outcome.finished);
        assert_eq!(outcome.final_step, "future");
        assert!(format_outcome(&outcome).contains("Waiting for your reply at step future"));
        let second = &llm.requests()[1];
        let tool_message = second.messages.last().expect("tool message");
        assert!(tool_message.text().contains("tool_denied"));
        assert!(store.load_state(&sid).await.expect("state").notes.is_empty());
    }
}
