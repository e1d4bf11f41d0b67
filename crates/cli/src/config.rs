use std::path::{Path, PathBuf};
use std::time::Duration;

use agent::{PolicyGuardrail, ProviderSettings, ToolDenialPolicy};
use proto::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Supported provider vendors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreset {
    /// OpenAI Chat Completions. Default.
    #[default]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini generateContent API.
    Gemini,
}

impl ProviderPreset {
    pub const fn all() -> &'static [Self] {
        &[Self::OpenAi, Self::Anthropic, Self::Gemini]
    }

    /// Default model ID. Used when `agent.model` is empty.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-sonnet-4-6",
            Self::Gemini => "gemini-2.0-flash",
        }
    }

    /// Vendor-specific API key environment variable.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl std::str::FromStr for ProviderPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub guardrail: GuardrailSection,

    #[serde(default)]
    pub flow: FlowSection,

    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_max_tool_rounds() -> usize {
    agent::runtime::DEFAULT_MAX_TOOL_ROUNDS
}

fn default_memory_window() -> usize {
    agent::runtime::DEFAULT_MEMORY_WINDOW
}

fn default_memory_max_items() -> usize {
    agent::runtime::DEFAULT_MEMORY_MAX_ITEMS
}

fn default_stream() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_step_retries() -> usize {
    orchestrator::DEFAULT_MAX_STEP_RETRIES
}

/// Provider, model and turn-loop settings shared by every step agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub provider: ProviderPreset,
    /// Model ID. Leave empty to use the preset default.
    #[serde(default)]
    pub model: String,
    /// API key (env overrides applied at load time; see `Config::load`).
    #[serde(default)]
    pub api_key: String,
    /// Explicit API base URL. Overrides the vendor default when non-empty.
    pub base_url: Option<String>,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
    #[serde(default = "default_memory_max_items")]
    pub memory_max_items: usize,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub tool_denial: ToolDenialPolicy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            provider: ProviderPreset::default(),
            model: String::new(),
            api_key: String::new(),
            base_url: None,
            max_tool_rounds: default_max_tool_rounds(),
            memory_window: default_memory_window(),
            memory_max_items: default_memory_max_items(),
            stream: default_stream(),
            request_timeout_secs: default_request_timeout_secs(),
            tool_denial: ToolDenialPolicy::default(),
        }
    }
}

impl AgentSection {
    /// Falls back to the preset default when `model` is empty.
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// Policy guardrail settings. Everything is off by default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardrailSection {
    /// Input budget, estimated as characters / 4.
    pub max_input_tokens: Option<usize>,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub redact_patterns: Vec<String>,
}

impl GuardrailSection {
    pub fn build(&self) -> PolicyGuardrail {
        let mut guard = PolicyGuardrail::new();
        if let Some(budget) = self.max_input_tokens {
            guard = guard.with_max_input_tokens(budget);
        }
        for pattern in &self.blocked_patterns {
            guard = guard.block(pattern.clone());
        }
        for tool in &self.denied_tools {
            guard = guard.deny_tool(tool.clone());
        }
        for pattern in &self.redact_patterns {
            guard = guard.redact(pattern.clone());
        }
        guard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSection {
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: usize,
}

impl Default for FlowSection {
    fn default() -> Self {
        Self {
            max_step_retries: default_max_step_retries(),
        }
    }
}

/// Session store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path or `sqlite:` URL.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            url: format!("{home}/.selfcraft/sessions.db"),
        }
    }
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join("config.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".selfcraft").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };

        if let Ok(provider) = std::env::var("SELFCRAFT_PROVIDER") {
            config.agent.provider = provider.parse::<ProviderPreset>().map_err(|reason| ConfigError::InvalidValue {
                field: "agent.provider".to_string(),
                reason,
            })?;
        }
        if let Ok(key) = std::env::var("SELFCRAFT_API_KEY") {
            config.agent.api_key = key;
        }
        if let Ok(model) = std::env::var("SELFCRAFT_MODEL") {
            config.agent.model = model;
        }
        if let Ok(url) = std::env::var("SELFCRAFT_DATABASE_URL") {
            config.database.url = url;
        }

        config.validate()?;
        debug!(
            provider = %config.agent.provider.name(),
            model = %config.agent.effective_model(),
            base_url = ?config.agent.effective_base_url(),
            "Config loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.max_tool_rounds".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.agent.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.request_timeout_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves the API key: `agent.api_key` (or `SELFCRAFT_API_KEY`), then
    /// the vendor-specific environment variable.
    pub fn resolve_api_key(&self) -> String {
        if !self.agent.api_key.is_empty() {
            debug!(source = "config", provider = %self.agent.provider.name(), "API key resolved");
            return self.agent.api_key.clone();
        }
        let env_var = self.agent.provider.api_key_env();
        match std::env::var(env_var) {
            Ok(key) if !key.is_empty() => {
                debug!(source = "env", env_var = %env_var, "API key resolved");
                key
            }
            _ => {
                debug!(provider = %self.agent.provider.name(), "No API key found from any source");
                String::new()
            }
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        let mut settings = ProviderSettings::new(self.resolve_api_key())
            .with_timeout(Duration::from_secs(self.agent.request_timeout_secs));
        if let Some(url) = self.agent.effective_base_url() {
            settings = settings.with_base_url(url);
        }
        settings
    }
}
