//! Session note tools backed by the [`proto::SessionStore`] in the tool context.

use std::sync::Arc;

use async_trait::async_trait;
use proto::{SessionId, SessionStore};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{Param, Tool, ToolContext, ToolFailure, ToolSpec};

fn session_handles(ctx: &ToolContext) -> Result<(&SessionId, &Arc<dyn SessionStore>), ToolFailure> {
    match (&ctx.session_id, &ctx.store) {
        (Some(session_id), Some(store)) => Ok((session_id, store)),
        _ => Err(ToolFailure::new(
            "MissingContext",
            "no session store is bound to this tool call",
        )),
    }
}

/// Appends a `{key, value}` note for the current step.
pub struct SaveNoteTool {
    spec: ToolSpec,
}

impl SaveNoteTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new(
                "save_note",
                "Persist a key/value note for the current session step.",
            )
            .param(Param::string("key").describe("Short label for the note"))
            .param(Param::any("value").describe("Any JSON value to remember")),
        }
    }
}

impl Default for SaveNoteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SaveNoteTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Value, ToolFailure> {
        let (session_id, store) = session_handles(ctx)?;
        let step = ctx.step.as_deref().unwrap_or("unscoped");
        let key = args.get("key").and_then(Value::as_str).unwrap_or_default();
        let value = args.get("value").cloned().unwrap_or(Value::Null);

        store
            .append_note(session_id, step, json!({ "key": key, "value": value }))
            .await
            .map_err(ToolFailure::from_error)?;
        debug!(session_id = %session_id, step, key, "Saved session note");

        Ok(json!({ "saved": true, "step": step, "key": key }))
    }
}

/// Lists notes stored for the session, optionally filtered by step.
pub struct ReadNotesTool {
    spec: ToolSpec,
}

impl ReadNotesTool {
    pub fn new() -> Self {
        Self {
            spec: ToolSpec::new("read_notes", "Read notes saved earlier in this session.")
                .param(
                    Param::string("step")
                        .describe("Only return notes saved during this step")
                        .optional(),
                ),
        }
    }
}

impl Default for ReadNotesTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadNotesTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Value, ToolFailure> {
        let (session_id, store) = session_handles(ctx)?;
        let state = store
            .load_state(session_id)
            .await
            .map_err(ToolFailure::from_error)?;
        let filter = args.get("step").and_then(Value::as_str);

        let notes: Vec<Value> = state
            .notes
            .iter()
            .filter(|note| filter.is_none_or(|step| note.step == step))
            .map(|note| json!({ "step": note.step, "payload": note.payload }))
            .collect();

        Ok(json!({ "count": notes.len(), "notes": notes }))
    }
}
