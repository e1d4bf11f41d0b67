//! Best-effort repair of truncated tool-call argument JSON.

use serde_json::Value;

/// Returns a well-formed JSON string for `raw`, or `None` when it cannot be
/// repaired. Empty input becomes `{}`; parseable input is re-serialized
/// compactly. Unterminated strings and brackets are closed, trailing commas
/// dropped, and a dangling `"key":` gets a `null` value.
pub fn repair_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some("{}".to_string());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value.to_string());
    }

    let mut out = String::with_capacity(trimmed.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in trimmed.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(ch) {
                    return None;
                }
                strip_trailing_comma(&mut out);
            }
            _ => {}
        }
        out.push(ch);
    }

    if escaped {
        out.pop();
    }
    if in_string {
        out.push('"');
    }

    trim_dangling(&mut out);
    while let Some(closer) = closers.pop() {
        trim_dangling(&mut out);
        out.push(closer);
    }

    serde_json::from_str::<Value>(&out)
        .ok()
        .map(|value| value.to_string())
}

fn strip_trailing_comma(out: &mut String) {
    let len = out.trim_end().len();
    out.truncate(len);
    if out.ends_with(',') {
        out.pop();
    }
}

fn trim_dangling(out: &mut String) {
    strip_trailing_comma(out);
    if out.ends_with(':') {
        out.push_str("null");
    }
}
