use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// LLM provider error.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Tool registration/execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Policy rejection raised by a guardrail.
    #[error("{0}")]
    Guardrail(#[from] GuardrailViolation),

    /// Session store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Step flow error.
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structured failure object handed to callers and to the model.
///
/// Every user-visible failure is expressed as one of these; raw error chains
/// never leave the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional structured context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl ErrorPayload {
    /// Creates a payload without details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Adds one detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Renders the payload as the `{"error": {...}}` object fed back to a model.
    pub fn to_tool_output(&self) -> Value {
        serde_json::json!({ "error": self })
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// LLM provider (adapter) errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote API failure.
    #[error("{0}")]
    Api(String),

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider did not answer within the configured budget.
    #[error("Provider timed out after {0}s")]
    Timeout(u64),

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Runtime exceeded configured tool-call rounds.
    #[error("Max tool rounds ({0}) exceeded")]
    MaxToolRoundsExceeded(usize),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The turn was cancelled by its caller.
    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Vendor-agnostic code used in `error` chunks and payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Api(_) => "api_error",
            Self::RateLimit => "rate_limit",
            Self::Timeout(_) => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
            Self::MaxToolRoundsExceeded(_) => "max_tool_rounds",
            Self::Serialization(_) => "serialization",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.to_string())
    }
}

/// Tool registry errors. All of them are recoverable: the runtime turns them
/// into tool-result content so the model can correct itself.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments were not valid JSON or did not match the schema.
    #[error("Invalid arguments for '{tool}': {message}")]
    Parameter { tool: String, message: String },

    /// Requested tool is unknown.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// The bound callable failed.
    #[error("Tool '{tool}' failed with {kind}: {message}")]
    Execution {
        tool: String,
        kind: String,
        message: String,
    },
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parameter { .. } => "parameter_error",
            Self::NotFound(_) => "not_found",
            Self::Execution { .. } => "execution_error",
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            Self::Parameter { tool, .. } | Self::Execution { tool, .. } => tool,
            Self::NotFound(tool) => tool,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let payload =
            ErrorPayload::new(self.code(), self.to_string()).with_detail("tool", self.tool_name());
        match self {
            Self::Execution { kind, .. } => payload.with_detail("kind", kind.as_str()),
            _ => payload,
        }
    }
}

/// Policy rejection. Terminal for the current turn.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Guardrail violation: {message}")]
pub struct GuardrailViolation {
    /// Human-readable reason.
    pub message: String,
    /// Structured context (reason code, offending tool, ...).
    pub details: Map<String, Value>,
}

impl GuardrailViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: "guardrail_violation".to_string(),
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

/// Session store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Step flow errors
#[derive(Debug, Error)]
pub enum FlowError {
    /// The store holds a step name this flow does not know.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// No agent was bound to a step of the topology.
    #[error("No agent registered for step {0}")]
    MissingAgent(String),

    /// A step kept requesting retries past the configured cap.
    #[error("Step {step} requested more than {limit} retries")]
    RetryLimit { step: String, limit: usize },

    /// A step agent returned a turn-terminal failure.
    #[error("Step {step} failed: {error}")]
    StepFailed { step: String, error: ErrorPayload },

    /// Persisting step progress failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl FlowError {
    pub fn payload(&self) -> ErrorPayload {
        match self {
            Self::UnknownStep(step) => {
                ErrorPayload::new("unknown_step", self.to_string()).with_detail("step", step.as_str())
            }
            Self::MissingAgent(step) => {
                ErrorPayload::new("missing_agent", self.to_string()).with_detail("step", step.as_str())
            }
            Self::RetryLimit { step, limit } => ErrorPayload::new("retry_limit", self.to_string())
                .with_detail("step", step.as_str())
                .with_detail("limit", *limit),
            Self::StepFailed { step, error } => {
                let mut payload = error.clone();
                payload.details.insert("step".to_string(), Value::from(step.as_str()));
                payload
            }
            Self::Store(err) => ErrorPayload::new("store_error", err.to_string()),
        }
    }
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid reflection kind string value.
    #[error("Invalid reflection kind: {0}")]
    InvalidReflectionKind(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
