//! Context compaction -- condense a conversation into one system message once
//! it grows past a size threshold.
//!
//! The size is [`Conversation::context_size`]: the content length of every
//! message plus the length of the system instructions.  When it exceeds
//! [`ContextCompactor::threshold`], the compactor:
//!
//! 1. Hands the full history to a [`Summarizer`].
//! 2. Replaces the conversation with a single system message holding the
//!    summary.
//! 3. Reports a [`CompactionEvent`] with the sizes before and after.
//!
//! Summarization failure leaves the conversation exactly as it was.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::ModelSettings;
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, Message};
use crate::llm::ChatBackend;

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

/// System instructions given to the summarizing model.
pub const SUMMARIZER_INSTRUCTIONS: &str = "You are a context compression assistant. Your task is \
     to summarize conversations concisely, preserving key facts, decisions, and context needed \
     for continuation.";

/// Built-in compression prompts, sent as the first user message of the
/// summarization request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPrompt {
    #[default]
    Minimalist,
    Structured,
    UltraShort,
    ContinuityFocus,
}

impl CompressionPrompt {
    /// The prompt text.
    pub fn text(self) -> &'static str {
        match self {
            Self::Minimalist => {
                "Summarize the conversation history concisely, preserving key facts, decisions, \
                 and context needed for continuation."
            }
            Self::Structured => {
                "Compress this conversation into a brief summary including:\n\
                 - Main topics discussed\n\
                 - Key decisions/conclusions\n\
                 - Important context for next exchanges\n\
                 Keep it under 200 words."
            }
            Self::UltraShort => {
                "Summarize this conversation: extract key facts, decisions, and essential \
                 context only."
            }
            Self::ContinuityFocus => {
                "Create a compact summary of this conversation that preserves all information \
                 needed to continue the discussion naturally."
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Summarizer boundary
// ---------------------------------------------------------------------------

/// Turns a message history into condensed text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`.  An error leaves the caller's history untouched.
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// [`Summarizer`] backed by a chat model.
pub struct LlmSummarizer {
    backend: Arc<dyn ChatBackend>,
    settings: ModelSettings,
    instructions: String,
    prompt: String,
}

impl std::fmt::Debug for LlmSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSummarizer")
            .field("settings", &self.settings)
            .field("prompt", &self.prompt)
            .finish()
    }
}

impl LlmSummarizer {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: ModelSettings) -> Self {
        Self {
            backend,
            settings,
            instructions: SUMMARIZER_INSTRUCTIONS.to_owned(),
            prompt: CompressionPrompt::default().text().to_owned(),
        }
    }

    /// Use one of the built-in compression prompts.
    pub fn with_prompt(mut self, prompt: CompressionPrompt) -> Self {
        self.prompt = prompt.text().to_owned();
        self
    }

    /// Use a caller-supplied compression prompt.
    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Replace the summarizer's system instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    fn request(&self, messages: &[Message]) -> ChatRequest {
        self.settings.request(vec![
            Message::system(self.instructions.clone()),
            Message::user(self.prompt.clone()),
            Message::user(format!(
                "CONVERSATION:\n{}",
                format_messages_for_summary(messages)
            )),
        ])
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        debug!(model = %self.settings.model, messages = messages.len(), "requesting summary");

        let completion = self
            .backend
            .complete(&self.request(messages))
            .await
            .map_err(|e| AgentError::SummarizationFailed {
                reason: e.to_string(),
            })?;

        let summary = completion.content.trim();
        if summary.is_empty() {
            return Err(AgentError::SummarizationFailed {
                reason: "summarizer returned an empty summary".into(),
            });
        }
        Ok(summary.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Compactor
// ---------------------------------------------------------------------------

/// Sizes observed around one compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionEvent {
    /// Threshold that was exceeded.
    pub trigger_size: usize,
    /// Context size before compaction.
    pub pre_size: usize,
    /// Context size after compaction.
    pub post_size: usize,
}

/// Replaces an oversized conversation with a summary.
pub struct ContextCompactor {
    threshold: usize,
    summarizer: Arc<dyn Summarizer>,
}

impl std::fmt::Debug for ContextCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCompactor")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ContextCompactor {
    /// Default context size threshold.
    pub const DEFAULT_THRESHOLD: usize = 8000;

    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            threshold: Self::DEFAULT_THRESHOLD,
            summarizer,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether `conversation` is over the threshold.
    pub fn needs_compaction(&self, conversation: &Conversation) -> bool {
        conversation.context_size() > self.threshold
    }

    /// Compact only when over the threshold; `Ok(None)` otherwise.
    ///
    /// # Errors
    ///
    /// Summarization failures.  The conversation is unmodified in that case.
    pub async fn compact_if_needed(
        &self,
        conversation: &mut Conversation,
    ) -> Result<Option<CompactionEvent>> {
        if !self.needs_compaction(conversation) {
            debug!(
                size = conversation.context_size(),
                threshold = self.threshold,
                "context below threshold, not compacting"
            );
            return Ok(None);
        }
        self.compact_now(conversation).await.map(Some)
    }

    /// Compact regardless of the threshold.
    pub async fn compact_now(&self, conversation: &mut Conversation) -> Result<CompactionEvent> {
        let pre_size = conversation.context_size();
        if conversation.is_empty() {
            return Ok(CompactionEvent {
                trigger_size: self.threshold,
                pre_size,
                post_size: pre_size,
            });
        }

        info!(
            messages = conversation.len(),
            size = pre_size,
            threshold = self.threshold,
            "compacting conversation"
        );

        let summary = self.summarizer.summarize(conversation.messages()).await?;
        conversation.replace_with_system(summary);

        let event = CompactionEvent {
            trigger_size: self.threshold,
            pre_size,
            post_size: conversation.context_size(),
        };
        info!(pre = event.pre_size, post = event.post_size, "compaction complete");
        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// One `role: content` line per message, tool calls indented below.
fn format_messages_for_summary(messages: &[Message]) -> String {
    let mut buf = String::with_capacity(messages.len() * 200);
    for msg in messages {
        buf.push_str(msg.role.as_str());
        buf.push_str(": ");
        buf.push_str(&msg.content);

        for tc in &msg.tool_calls {
            buf.push_str(&format!("\n  [tool_call: {}({})]", tc.name, tc.arguments));
        }

        buf.push('\n');
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
