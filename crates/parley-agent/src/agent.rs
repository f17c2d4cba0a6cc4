//! Chat personas and the completion channel.
//!
//! A [`ChatAgent`] is one backend persona: a model configuration, a set of
//! system instructions, and the [`Conversation`] it exclusively owns.  Its
//! [`stream_completion`](ChatAgent::stream_completion) method is the
//! completion channel every final answer flows through:
//!
//! 1. The request is built from the history plus the new messages.
//! 2. Chunks are handed to the caller's callback in arrival order.  Reasoning
//!    precedes content; a single [`StreamEvent::EndOfReasoning`] marks the
//!    switch.
//! 3. The cancel flag is checked before every chunk.
//! 4. Only a fully successful exchange mutates the conversation: the new
//!    messages and exactly one assistant message are appended together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, Message};
use crate::llm::ChatBackend;

// ---------------------------------------------------------------------------
// Model settings
// ---------------------------------------------------------------------------

/// Model identifier and sampling parameters for one backend consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model identifier.  Empty means "the client's default model".
    #[serde(default)]
    pub model: String,

    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens per response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    /// Settings for the given model with backend-default sampling.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// A request carrying these settings and the given messages.
    pub fn request(&self, messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..ChatRequest::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag for one agent's streams.
///
/// Clones share the flag, so a handle can be given to another task or to the
/// streaming callback itself.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Request cancellation of the in-flight stream.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for the next exchange.
    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Stream events and results
// ---------------------------------------------------------------------------

/// One event delivered to a streaming callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// A fragment of reasoning text.
    Reasoning(&'a str),
    /// Reasoning is over; content follows.  Fires at most once per exchange.
    EndOfReasoning,
    /// A fragment of answer content.
    Content(&'a str),
    /// The exchange finished with the given backend finish reason.
    Finished { finish_reason: &'a str },
}

/// Outcome of one successful completion exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionResult {
    /// Concatenated answer content (also stored as the assistant message).
    pub content: String,
    /// Concatenated reasoning text, empty for non-reasoning models.
    pub reasoning: String,
    /// Backend finish reason (`"stop"`, `"length"`, ...).
    pub finish_reason: String,
}

// ---------------------------------------------------------------------------
// Chat agent
// ---------------------------------------------------------------------------

/// One backend persona and the conversation it owns.
pub struct ChatAgent {
    name: String,
    settings: ModelSettings,
    conversation: Conversation,
    backend: Arc<dyn ChatBackend>,
    cancel: CancelFlag,
    keep_history: bool,
}

impl std::fmt::Debug for ChatAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatAgent")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("messages", &self.conversation.len())
            .field("keep_history", &self.keep_history)
            .finish()
    }
}

impl ChatAgent {
    /// Create a persona whose conversation starts with `system_instructions`.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        settings: ModelSettings,
        system_instructions: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            conversation: Conversation::new(system_instructions),
            backend,
            cancel: CancelFlag::default(),
            keep_history: true,
        }
    }

    /// When `false`, each exchange only sees the system instructions and
    /// the history is reset before the new messages are stored.
    pub fn with_keep_history(mut self, keep_history: bool) -> Self {
        self.keep_history = keep_history;
        self
    }

    /// Whether earlier exchanges are sent with each new one.
    pub fn keeps_history(&self) -> bool {
        self.keep_history
    }

    /// A fresh conversation holding only the leading system message, the
    /// context a persona without history answers from.
    pub(crate) fn scratch_conversation(&self) -> Conversation {
        let head = self.conversation.len() - self.conversation.without_system().len();
        let mut scratch = Conversation::new("");
        scratch.extend(self.conversation.messages()[..head].iter().cloned());
        scratch
    }

    /// The persona's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model settings used for every exchange.
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// The owned conversation.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Mutable access for pipeline steps that append on the persona's behalf
    /// (tool orchestration, compaction, hand-off).
    pub fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    /// Current context size of the conversation.
    pub fn context_size(&self) -> usize {
        self.conversation.context_size()
    }

    /// A handle that cancels this agent's in-flight stream.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Interrupt the in-flight stream.
    pub fn stop_stream(&self) {
        self.cancel.cancel();
    }

    /// Truncate the history to the leading system message.
    pub fn reset_messages(&mut self) {
        self.conversation.reset();
    }

    /// Replace the system instructions in place.
    pub fn set_system_instructions(&mut self, instructions: impl Into<String>) {
        self.conversation.set_system_instructions(instructions);
    }

    /// Pretty JSON export of the history.
    pub fn export_messages_json(&self) -> Result<String> {
        self.conversation.export_json()
    }

    /// Messages sent to the backend for an exchange adding `new_messages`.
    fn outgoing(&self, new_messages: &[Message]) -> Vec<Message> {
        let history = if self.keep_history {
            self.conversation.messages()
        } else {
            let head = self.conversation.len() - self.conversation.without_system().len();
            &self.conversation.messages()[..head]
        };
        history.iter().chain(new_messages).cloned().collect()
    }

    /// Store a successful exchange.
    fn commit(&mut self, new_messages: Vec<Message>, content: &str) {
        if !self.keep_history {
            self.conversation.reset();
        }
        self.conversation.extend(new_messages);
        self.conversation.push(Message::assistant(content));
    }

    /// Run a non-streaming exchange.
    ///
    /// # Errors
    ///
    /// Transport, parse and empty-completion failures; the conversation is
    /// left untouched on error.
    pub async fn complete(&mut self, new_messages: Vec<Message>) -> Result<CompletionResult> {
        let request = self.settings.request(self.outgoing(&new_messages));
        let completion = self.backend.complete(&request).await?;

        self.commit(new_messages, &completion.content);
        info!(
            agent = %self.name,
            finish_reason = %completion.finish_reason,
            context_size = self.context_size(),
            "completion appended"
        );

        Ok(CompletionResult {
            content: completion.content,
            reasoning: completion.reasoning,
            finish_reason: completion.finish_reason,
        })
    }

    /// Run a streamed exchange, delivering every chunk to `on_event`.
    ///
    /// # Errors
    ///
    /// - [`AgentError::StreamCanceled`] if the cancel flag was raised.
    /// - [`AgentError::EmptyCompletion`] if the stream carried no choice.
    /// - Any error returned by `on_event`, unchanged.
    /// - Transport and stream errors from the backend.
    ///
    /// In every error case the conversation is left untouched.
    pub async fn stream_completion<F>(
        &mut self,
        new_messages: Vec<Message>,
        on_event: F,
    ) -> Result<CompletionResult>
    where
        F: FnMut(StreamEvent<'_>) -> Result<()> + Send,
    {
        self.cancel.reset();
        let cancel = self.cancel.clone();
        self.stream_with_cancel(new_messages, &cancel, on_event).await
    }

    /// Streamed exchange observing `cancel` instead of the agent's own flag.
    ///
    /// The flag is not re-armed here; its owner decides when a new exchange
    /// starts.
    pub(crate) async fn stream_with_cancel<F>(
        &mut self,
        new_messages: Vec<Message>,
        cancel: &CancelFlag,
        mut on_event: F,
    ) -> Result<CompletionResult>
    where
        F: FnMut(StreamEvent<'_>) -> Result<()> + Send,
    {
        let request = self.settings.request(self.outgoing(&new_messages));
        let mut stream = self.backend.stream(&request).await?;

        let mut result = CompletionResult::default();
        let mut choice_chunks = 0usize;
        let mut reasoning_ended = false;
        let mut content_started = false;

        loop {
            if cancel.is_cancelled() {
                info!(agent = %self.name, chunks = choice_chunks, "stream canceled");
                return Err(AgentError::StreamCanceled);
            }

            let Some(item) = stream.next().await else {
                break;
            };
            let delta = item?;

            if cancel.is_cancelled() {
                info!(agent = %self.name, chunks = choice_chunks, "stream canceled");
                return Err(AgentError::StreamCanceled);
            }
            choice_chunks += 1;

            if let Some(reasoning) = delta.reasoning.as_deref() {
                if content_started {
                    // Reasoning never follows content.
                    debug!(agent = %self.name, len = reasoning.len(), "late reasoning dropped");
                } else {
                    result.reasoning.push_str(reasoning);
                    on_event(StreamEvent::Reasoning(reasoning))?;
                }
            }

            if let Some(content) = delta.content.as_deref() {
                content_started = true;
                if !result.reasoning.is_empty() && !reasoning_ended {
                    reasoning_ended = true;
                    on_event(StreamEvent::EndOfReasoning)?;
                }
                result.content.push_str(content);
                on_event(StreamEvent::Content(content))?;
            }

            if let Some(reason) = delta.finish_reason {
                result.finish_reason = reason;
            }
        }

        if choice_chunks == 0 {
            return Err(AgentError::EmptyCompletion);
        }

        // Reasoning-only answers still get their marker.
        if !result.reasoning.is_empty() && !reasoning_ended {
            on_event(StreamEvent::EndOfReasoning)?;
        }

        on_event(StreamEvent::Finished {
            finish_reason: &result.finish_reason,
        })?;

        self.commit(new_messages, &result.content);
        debug!(
            agent = %self.name,
            chunks = choice_chunks,
            content_len = result.content.len(),
            finish_reason = %result.finish_reason,
            "stream completed"
        );

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
