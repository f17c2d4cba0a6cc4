//! LLM integration layer.
//!
//! This module provides the interface between the conversation runtime and
//! the inference backend.  It is organized into:
//!
//! - [`types`] -- Core data types (messages, tool calls, completions, deltas).
//! - [`backend`] -- The [`ChatBackend`] trait every model consumer goes through.
//! - [`client`] -- HTTP client for OpenAI-compatible endpoints.
//! - [`streaming`] -- SSE line parser for incremental responses.

pub mod backend;
pub mod client;
pub mod streaming;
pub mod types;

// Re-export the most commonly used types for convenience.
pub use backend::{ChatBackend, DeltaStream};
pub use client::{LlmClient, LlmClientConfig};
pub use types::{
    ChatRequest, Completion, Message, ParamType, Role, StreamDelta, ToolCall, ToolDefinition,
    ToolParameter,
};
