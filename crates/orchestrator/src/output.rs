//! Structured step output parsed from an agent's final text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Directive a step attaches to its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflexion {
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub next_action: Option<String>,
}

impl Reflexion {
    pub fn wants_retry(&self) -> bool {
        self.status.eq_ignore_ascii_case("retry")
    }
}

/// Parsed output of one step turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// User-visible content.
    pub payload: Value,
    pub next_step: Option<String>,
    /// Present only when the step reported a gap list.
    pub gaps: Option<Vec<Value>>,
    pub reflexion: Option<Reflexion>,
}

impl StepOutput {
    pub fn from_payload(payload: Value) -> Self {
        Self {
            payload,
            next_step: None,
            gaps: None,
            reflexion: None,
        }
    }

    /// Parses agent text. A JSON object (optionally fenced) is read field by
    /// field; anything else becomes a plain text payload.
    pub fn parse(text: &str) -> Self {
        let Some(Value::Object(mut obj)) = extract_json(text) else {
            debug!("Step output is not a JSON object, using raw text");
            return Self::from_payload(Value::String(text.trim().to_string()));
        };

        let next_step = obj
            .remove("next_step")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());
        let reflexion = obj
            .remove("reflexion")
            .and_then(|v| serde_json::from_value::<Reflexion>(v).ok());
        let mut gaps = obj.remove("gaps").and_then(into_list);
        let payload = match obj.remove("payload") {
            Some(payload) => payload,
            None => Value::Object(obj),
        };
        if gaps.is_none() {
            gaps = payload.get("gaps").cloned().and_then(into_list);
        }

        Self {
            payload,
            next_step,
            gaps,
            reflexion,
        }
    }

    /// `true` only when a gap list was reported and it is empty.
    pub fn reports_no_gaps(&self) -> bool {
        self.gaps.as_ref().is_some_and(Vec::is_empty)
    }

    pub fn retry_requested(&self) -> Option<&Reflexion> {
        self.reflexion.as_ref().filter(|r| r.wants_retry())
    }

    /// Payload rendered for display or as context for the next step.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

fn into_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn extract_json(text: &str) -> Option<Value> {
    let trimmed = strip_fences(text.trim());
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_full_contract() {
        let out = StepOutput::parse(
            r#"{"payload":"Three gaps found","next_step":"vision","gaps":["a","b","c"],
                "reflexion":{"status":"done","reason":"","next_action":null}}"#,
        );
        assert_eq!(out.payload, json!("Three gaps found"));
        assert_eq!(out.next_step.as_deref(), Some("vision"));
        assert_eq!(out.gaps.as_ref().map(Vec::len), Some(3));
        assert!(out.retry_requested().is_none());
        assert!(!out.reports_no_gaps());
    }

    #[test]
    fn fenced_json_is_accepted() {
        let out = StepOutput::parse("```json\n{\"gaps\": [], \"payload\": \"none\"}\n```");
        assert!(out.reports_no_gaps());
        assert_eq!(out.payload_text(), "none");
    }

    #[test]
    fn retry_directive_is_detected() {
        let out = StepOutput::parse(
            r#"Sure. {"payload":"x","reflexion":{"status":"RETRY","reason":"need_retry","next_action":"ask again"}}"#,
        );
        let reflexion = out.retry_requested().expect("retry");
        assert_eq!(reflexion.reason, "need_retry");
        assert_eq!(reflexion.next_action.as_deref(), Some("ask again"));
    }

    #[test]
    fn plain_text_becomes_payload() {
        let out = StepOutput::parse("  Tell me more about your goal.  ");
        assert_eq!(out.payload, json!("Tell me more about your goal."));
        assert_eq!(out.next_step, None);
        assert_eq!(out.gaps, None);
        assert!(!out.reports_no_gaps());
    }

    #[test]
    fn object_without_payload_key_is_the_payload() {
        let out = StepOutput::parse(r#"{"summary":"ok","gaps":[]}"#);
        assert_eq!(out.payload, json!({"summary": "ok"}));
        assert!(out.reports_no_gaps());
    }

    #[test]
    fn gaps_nested_in_payload_are_found() {
        let out = StepOutput::parse(r#"{"payload":{"gaps":["time"]}}"#);
        assert_eq!(out.gaps, Some(vec![json!("time")]));
    }
}
