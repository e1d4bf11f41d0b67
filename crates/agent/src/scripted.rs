//! In-process provider that replays scripted chunk rounds. Used by tests and
//! by callers that need a deterministic offline provider.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{FinishReason, LlmError, StreamChunk, TokenUsage};
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatRequest, ChunkStream, LlmProvider};

/// Provider that answers each `send` with the next scripted round and records
/// every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    rounds: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(rounds: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            rounds: Mutex::new(VecDeque::from(rounds)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Appends one more round to the script.
    pub fn push_round(&self, round: Vec<StreamChunk>) {
        self.rounds.lock().push_back(round);
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.rounds.lock().len()
    }

    /// A plain text answer.
    pub fn text_round(text: impl Into<String>) -> Vec<StreamChunk> {
        vec![
            StreamChunk::delta(text),
            StreamChunk::finish(FinishReason::Stop),
            StreamChunk::Usage(TokenUsage::new(10, 5)),
        ]
    }

    /// One tool call streamed as start, a single fragment, and end.
    pub fn tool_round(id: &str, name: &str, arguments: &str) -> Vec<StreamChunk> {
        vec![
            StreamChunk::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
                arguments: String::new(),
            },
            StreamChunk::ToolCallDelta {
                id: id.to_string(),
                fragment: arguments.to_string(),
            },
            StreamChunk::ToolCallEnd {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
            StreamChunk::finish(FinishReason::ToolCalls),
            StreamChunk::Usage(TokenUsage::new(10, 5)),
        ]
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, req: ChatRequest, _cancel: CancellationToken) -> Result<ChunkStream, LlmError> {
        self.requests.lock().push(req);
        let round = self.rounds.lock().pop_front();
        Ok(match round {
            Some(chunks) => ChunkStream::from_chunks(chunks),
            None => ChunkStream::failed(&LlmError::InvalidResponse(
                "No scripted response left".to_string(),
            )),
        })
    }
}
