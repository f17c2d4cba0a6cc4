//! Conversation history owned by a single agent.
//!
//! A [`Conversation`] is an ordered list of [`Message`]s with at most one
//! leading system message.  It keeps a running count of content bytes so the
//! context size can be read without walking the history.

use serde::Serialize;

use crate::error::Result;
use crate::llm::types::{Message, Role};

/// Ordered message history plus the system instructions that seeded it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Conversation {
    messages: Vec<Message>,
    #[serde(skip)]
    system_instructions: String,
    /// Sum of `content.len()` over `messages`.
    #[serde(skip)]
    content_size: usize,
}

impl Conversation {
    /// Create a conversation seeded with a system message.  Empty
    /// instructions produce an empty conversation.
    pub fn new(system_instructions: impl Into<String>) -> Self {
        let system_instructions = system_instructions.into();
        let mut conversation = Self {
            system_instructions: system_instructions.clone(),
            ..Self::default()
        };
        if !system_instructions.is_empty() {
            conversation.push(Message::system(system_instructions));
        }
        conversation
    }

    /// The messages in order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if there are no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The system instructions this conversation was seeded with.
    pub fn system_instructions(&self) -> &str {
        &self.system_instructions
    }

    /// Context size: content length of every message plus the length of the
    /// system instructions.
    pub fn context_size(&self) -> usize {
        self.content_size + self.system_instructions.len()
    }

    /// Append one message.
    ///
    /// A system message is only accepted at the head of an empty
    /// conversation; later ones are folded into the leading slot via
    /// [`set_system_instructions`](Self::set_system_instructions) semantics
    /// so the history never carries two.
    pub fn push(&mut self, message: Message) {
        if message.role == Role::System && !self.messages.is_empty() {
            self.replace_leading_system(message.content);
            return;
        }
        self.content_size += message.content.len();
        self.messages.push(message);
    }

    /// Append several messages in order.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.push(message);
        }
    }

    /// The last message, if any.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// All messages except the leading system message.
    pub fn without_system(&self) -> &[Message] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }

    /// Drop every message after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.messages.len() {
            return;
        }
        self.messages.truncate(len);
        self.recount();
    }

    /// Remove and return every message after the first `at`.
    pub fn split_off(&mut self, at: usize) -> Vec<Message> {
        if at >= self.messages.len() {
            return Vec::new();
        }
        let tail = self.messages.split_off(at);
        self.recount();
        tail
    }

    /// Remove the last `n` messages, never touching the leading system
    /// message.
    pub fn remove_last_n(&mut self, n: usize) {
        let floor = self.len() - self.without_system().len();
        let keep = self.len().saturating_sub(n).max(floor);
        self.truncate(keep);
    }

    /// Truncate to the leading system message, or to empty if there is none.
    pub fn reset(&mut self) {
        let floor = self.len() - self.without_system().len();
        self.truncate(floor);
    }

    /// Replace the whole history with a single system message.
    pub fn replace_with_system(&mut self, content: impl Into<String>) {
        self.messages = vec![Message::system(content)];
        self.recount();
    }

    /// Change the system instructions, rewriting the leading system message
    /// in place (or inserting one).
    pub fn set_system_instructions(&mut self, instructions: impl Into<String>) {
        self.system_instructions = instructions.into();
        let content = self.system_instructions.clone();
        self.replace_leading_system(content);
    }

    /// Pretty JSON export of the messages.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.messages)?)
    }

    fn replace_leading_system(&mut self, content: String) {
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = content,
            _ => self.messages.insert(0, Message::system(content)),
        }
        self.recount();
    }

    fn recount(&mut self) {
        self.content_size = self.messages.iter().map(|m| m.content.len()).sum();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
