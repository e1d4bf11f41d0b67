//! Session state and the external store contract used by the step flow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtoError, StoreError};
use crate::message::{Message, SessionId};

/// Reflection log entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionKind {
    /// Step-local retry note.
    Micro,
    /// Whole-session summary written once at completion.
    Macro,
}

impl std::fmt::Display for ReflectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Micro => write!(f, "micro"),
            Self::Macro => write!(f, "macro"),
        }
    }
}

impl std::str::FromStr for ReflectionKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "micro" => Ok(Self::Micro),
            "macro" => Ok(Self::Macro),
            other => Err(ProtoError::InvalidReflectionKind(other.to_string())),
        }
    }
}

/// Opaque payload written by a tool for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNote {
    pub step: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// One reflection log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub step: String,
    pub kind: ReflectionKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Everything the store knows about one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    /// `None` until the first run persists a step.
    pub current_step: Option<String>,
    pub notes: Vec<StepNote>,
    pub reflections: Vec<ReflectionEntry>,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            current_step: None,
            notes: Vec::new(),
            reflections: Vec::new(),
        }
    }

    /// Reflection entries of the given kind, oldest first.
    pub fn reflections_of(&self, kind: ReflectionKind) -> impl Iterator<Item = &ReflectionEntry> {
        self.reflections.iter().filter(move |r| r.kind == kind)
    }

    /// Notes written during `step`, oldest first.
    pub fn notes_for<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a StepNote> + 'a {
        self.notes.iter().filter(move |n| n.step == step)
    }
}

/// External session store. Must provide read-your-writes consistency per
/// session id; no cross-session locking is expected from callers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current step name, `None` for a brand-new session.
    async fn get_step(&self, session_id: &SessionId) -> Result<Option<String>, StoreError>;

    async fn set_step(&self, session_id: &SessionId, step: &str) -> Result<(), StoreError>;

    async fn append_note(
        &self,
        session_id: &SessionId,
        step: &str,
        payload: Value,
    ) -> Result<(), StoreError>;

    async fn append_reflection(
        &self,
        session_id: &SessionId,
        step: &str,
        kind: ReflectionKind,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Full snapshot; an unknown session yields an empty state.
    async fn load_state(&self, session_id: &SessionId) -> Result<SessionState, StoreError>;

    /// Appends the messages of one completed agent turn. Stores that keep no
    /// conversation history may ignore this.
    async fn append_history(
        &self,
        _session_id: &SessionId,
        _agent: &str,
        _messages: &[Message],
    ) -> Result<(), StoreError> {
        Ok(())
    }

    /// The most recent `limit` history messages of `agent` in this session,
    /// oldest first. `limit == 0` returns everything.
    async fn load_history(
        &self,
        _session_id: &SessionId,
        _agent: &str,
        _limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn reflection_kind_round_trip() {
        for kind in [ReflectionKind::Micro, ReflectionKind::Macro] {
            assert_eq!(ReflectionKind::from_str(&kind.to_string()).expect("parse"), kind);
        }
        assert!(ReflectionKind::from_str("meso").is_err());
    }

    #[test]
    fn state_filters_reflections_and_notes() {
        let mut state = SessionState::new(SessionId::from("s1"));
        state.reflections.push(ReflectionEntry {
            step: "gap".into(),
            kind: ReflectionKind::Micro,
            content: "need_retry".into(),
            created_at: Utc::now(),
        });
        state.notes.push(StepNote {
            step: "future".into(),
            payload: serde_json::json!({"goal":"x"}),
            created_at: Utc::now(),
        });

        assert_eq!(state.reflections_of(ReflectionKind::Micro).count(), 1);
        assert_eq!(state.reflections_of(ReflectionKind::Macro).count(), 0);
        assert_eq!(state.notes_for("future").count(), 1);
        assert_eq!(state.notes_for("gap").count(), 0);
    }
}
