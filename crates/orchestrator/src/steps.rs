//! Fixed step topology of the self-development flow.

use std::fmt;
use std::str::FromStr;

use proto::FlowError;
use serde::{Deserialize, Serialize};

/// One named stage of the flow, in default order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Future,
    Motivation,
    History,
    Gap,
    Vision,
    Reflect,
}

impl Step {
    pub const ORDER: [Step; 6] = [
        Step::Future,
        Step::Motivation,
        Step::History,
        Step::Gap,
        Step::Vision,
        Step::Reflect,
    ];

    pub fn first() -> Step {
        Self::ORDER[0]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::Motivation => "motivation",
            Self::History => "history",
            Self::Gap => "gap",
            Self::Vision => "vision",
            Self::Reflect => "reflect",
        }
    }

    /// Successor in default order; `None` after the terminal step.
    pub fn next(self) -> Option<Step> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Reflect
    }

    /// Built-in system instructions for the step agent.
    pub fn default_instructions(self) -> &'static str {
        match self {
            Self::Future => {
                "You help the user describe the future self they want to become. \
                 Ask about the role, skills and daily life they picture in a few years."
            }
            Self::Motivation => {
                "You uncover why the user's envisioned future matters to them. \
                 Focus on values and the feelings behind the goal."
            }
            Self::History => {
                "You review the user's past experience that relates to their goal. \
                 Collect concrete achievements, setbacks and lessons."
            }
            Self::Gap => {
                "You compare the envisioned future with the user's history and list \
                 the concrete gaps. Return an empty `gaps` list when nothing is missing."
            }
            Self::Vision => {
                "You turn the identified gaps into a short vision statement and a \
                 first set of actionable milestones."
            }
            Self::Reflect => {
                "You reflect on the whole conversation, confirm what was decided, \
                 and close the session."
            }
        }
    }
}

/// Output contract appended to every step's instructions.
pub const OUTPUT_CONTRACT: &str = "Answer with a single JSON object: \
{\"payload\": <what the user should see>, \"next_step\": <step name or \"complete\">, \
\"gaps\": [<gap items, gap step only>], \
\"reflexion\": {\"status\": \"retry\"|\"done\", \"reason\": <text>, \"next_action\": <text>}}. \
Set `next_step` to the current step name when you need more input from the user.";

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .copied()
            .find(|step| step.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FlowError::UnknownStep(s.to_string()))
    }
}
