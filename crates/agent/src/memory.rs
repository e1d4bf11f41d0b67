//! Bounded conversation memory owned by one agent.

use std::collections::VecDeque;

use proto::{Message, Role};
use tracing::trace;

/// Insertion-ordered message memory with a hard item cap.
///
/// Pushing beyond `max_items` evicts the oldest entry first. Messages without
/// text or tool calls are not admitted. Neither the retained history nor a
/// window ever starts with a tool result cut off from its assistant call.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    items: VecDeque<Message>,
    max_items: usize,
}

impl ConversationMemory {
    /// `max_items == 0` means unbounded.
    pub fn new(max_items: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_items,
        }
    }

    /// Admits `message` if it carries a payload. Returns whether it was stored.
    pub fn push(&mut self, message: Message) -> bool {
        if !message.has_payload() {
            trace!(role = %message.role, "Skipping empty message for memory");
            return false;
        }
        self.items.push_back(message);
        if self.max_items > 0 && self.items.len() > self.max_items {
            while self.items.len() > self.max_items {
                self.items.pop_front();
            }
            while self.items.front().is_some_and(|m| m.role == Role::Tool) {
                self.items.pop_front();
            }
        }
        true
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.push(message);
        }
    }

    /// The most recent `n` entries in order; `0` returns everything retained.
    ///
    /// A window that would open on tool results widens back to the assistant
    /// message that requested them, so it may hold slightly more than `n`.
    pub fn window(&self, n: usize) -> Vec<Message> {
        let mut start = if n == 0 {
            0
        } else {
            self.items.len().saturating_sub(n)
        };
        while start > 0 && self.items[start].role == Role::Tool {
            start -= 1;
        }
        while self.items.get(start).is_some_and(|m| m.role == Role::Tool) {
            start += 1;
        }
        self.items.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(200)
    }
}
