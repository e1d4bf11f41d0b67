use serde::Serialize;
use serde_json::{Map, Value};

use crate::{FnTool, Param, ToolSpec};

const DEFAULT_LIMIT: i64 = 400;

#[derive(Debug, Serialize)]
struct CharacterCount {
    characters: usize,
    without_whitespace: usize,
    limit: i64,
    within_limit: bool,
}

/// `count_characters`: lets the model check a draft against a length limit.
pub fn count_characters_tool() -> FnTool {
    let spec = ToolSpec::new(
        "count_characters",
        "Count the characters in a piece of text and compare against a limit.",
    )
    .param(Param::string("text").describe("Text to measure"))
    .param(
        Param::integer("limit")
            .describe("Maximum allowed characters")
            .default(DEFAULT_LIMIT),
    );

    FnTool::sync(spec, |args: Map<String, Value>| {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        let limit = args
            .get("limit")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_LIMIT);
        let characters = text.chars().count();
        Ok::<_, std::convert::Infallible>(CharacterCount {
            characters,
            without_whitespace: text.chars().filter(|c| !c.is_whitespace()).count(),
            limit,
            within_limit: (characters as i64) <= limit,
        })
    })
}
