//! Agent error types.
//!
//! All runtime subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.
//! Tool execution failures are deliberately absent: they are serialized into
//! the conversation by the orchestrator (see [`crate::tools::ToolError`]).

/// Unified error type for the conversation runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ----------------------------------------------------------
    /// An HTTP request to the inference backend failed.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The backend response could not be parsed into the expected format.
    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    /// The streaming SSE connection was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    /// The backend answered without a single choice.
    #[error("empty completion: backend returned no choices")]
    EmptyCompletion,

    // -- Streaming control ---------------------------------------------------
    /// The stream was cancelled through the agent's cancel flag.
    #[error("stream canceled")]
    StreamCanceled,

    /// The caller's streaming callback refused a chunk.
    #[error("stream callback failed: {reason}")]
    Callback { reason: String },

    // -- Orchestration errors ------------------------------------------------
    /// The tool loop hit its round cap without reaching a final answer.
    #[error("tool loop exceeded max rounds ({max_rounds})")]
    MaxRoundsExceeded { max_rounds: u32 },

    /// A tool with the same name is already registered.
    #[error("duplicate tool: {tool_name}")]
    DuplicateTool { tool_name: String },

    // -- Persona errors ------------------------------------------------------
    /// No persona is registered under the given id.
    #[error("unknown persona: {persona_id}")]
    UnknownPersona { persona_id: String },

    /// A persona with the same id is already registered.
    #[error("persona already registered: {persona_id}")]
    DuplicatePersona { persona_id: String },

    /// The currently selected persona cannot be removed.
    #[error("cannot remove the active persona: {persona_id}")]
    ActivePersonaRemoval { persona_id: String },

    // -- Sub-agent errors ----------------------------------------------------
    /// The topic classifier could not produce a topic.
    #[error("topic classification failed: {reason}")]
    ClassificationFailed { reason: String },

    /// The summarizer could not condense the conversation.
    #[error("summarization failed: {reason}")]
    SummarizationFailed { reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Validation failed for input data.
    #[error("validation error: {reason}")]
    ValidationError { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Returns `true` for the cooperative cancellation failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::StreamCanceled)
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}
