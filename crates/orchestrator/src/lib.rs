//! Step flow for guided self-development sessions.
//!
//! An [`Orchestrator`] walks a fixed topology of [`Step`]s, one agent per
//! step, and persists progress through a [`proto::SessionStore`].

pub mod flow;
pub mod output;
pub mod steps;
pub mod store;

pub use flow::{COMPLETE, DEFAULT_MAX_STEP_RETRIES, Orchestrator, OrchestratorBuilder, RunOutcome, StepAgent, StepRecord};
pub use output::{Reflexion, StepOutput};
pub use steps::{OUTPUT_CONTRACT, Step};
pub use store::{InMemorySessionStore, SqliteSessionStore};
