//! Conversation runtime for Parley.
//!
//! This crate drives turns of a conversation with an OpenAI-compatible
//! inference backend: it routes each question to one of several personas,
//! lets the model call external tools under an optional confirmation gate,
//! streams the final answer chunk by chunk and keeps conversations bounded
//! through summarization.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────────── Crew ─────────────────────────┐
//!  question ──>│ AgentRouter ──> ToolOrchestrator ──> ChatAgent ──> ContextCompactor
//!              │ (topic)         (tool calls)         (stream)      (summary)
//!              └───────┬────────────────┬────────────────┬──────────────┬┘
//!                      └────────────────┴── ChatBackend ─┴──────────────┘
//!                                              │
//!                                         ┌────┴─────┐
//!                                         │ LlmClient│  (HTTP + SSE)
//!                                         └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- Wire types, the [`ChatBackend`] seam and the HTTP client.
//! - [`conversation`] -- Message history with a running size counter.
//! - [`agent`] -- One persona and its streaming completion channel.
//! - [`tools`] -- Tool registry, execution boundaries and orchestration.
//! - [`compaction`] -- Threshold-triggered conversation summarization.
//! - [`router`] -- Topic classification and persona hand-off.
//! - [`crew`] -- The per-turn pipeline tying everything together.
//! - [`config`] -- File and environment configuration.
//! - [`error`] -- Agent error types.

pub mod agent;
pub mod compaction;
pub mod config;
pub mod conversation;
pub mod crew;
pub mod error;
pub mod llm;
pub mod router;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the most commonly used types at the crate root.
pub use agent::{CancelFlag, ChatAgent, CompletionResult, ModelSettings, StreamEvent};
pub use compaction::{
    CompactionEvent, CompressionPrompt, ContextCompactor, LlmSummarizer, Summarizer,
};
pub use config::RuntimeConfig;
pub use conversation::Conversation;
pub use crew::{Crew, CrewBuilder, TurnResult};
pub use error::{AgentError, Result};
pub use llm::{
    ChatBackend, ChatRequest, Completion, DeltaStream, LlmClient, LlmClientConfig, Message,
    ParamType, Role, StreamDelta, ToolCall, ToolDefinition, ToolParameter,
};
pub use router::{AgentRouter, LlmTopicClassifier, RoutingDecision, RoutingTable, TopicClassifier};
pub use tools::{
    CallStatus, Confirmation, ConfirmationGate, StopReason, ToolCallMode, ToolError, ToolInvoker,
    ToolOrchestrator, ToolRegistry, ToolRunOutcome, confirm_fn, invoke_fn,
};
