//! SSE stream parser for the OpenAI-compatible Chat Completions API.
//!
//! The streaming format sends `data:` lines in standard SSE format with JSON
//! payloads containing `choices[].delta` objects.  The stream terminates with
//! a `data: [DONE]` sentinel.  This module turns those lines into
//! [`StreamDelta`] values that the completion channel consumes one by one.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::StreamDelta;

// ---------------------------------------------------------------------------
// Line parser
// ---------------------------------------------------------------------------

/// Parses SSE lines from an OpenAI-compatible stream.
///
/// The parser is line oriented: the HTTP layer splits the byte stream on
/// newlines and feeds each complete line through [`feed_line`].  Lines that
/// carry no choice (usage frames, comments, `event:` fields) yield `None`.
///
/// [`feed_line`]: OpenAiStreamParser::feed_line
#[derive(Debug, Default)]
pub struct OpenAiStreamParser {
    /// Whether the `[DONE]` sentinel has been received.
    done: bool,

    /// Number of chunks that carried at least one choice.
    choice_chunks: usize,
}

impl OpenAiStreamParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the `[DONE]` sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of chunks seen so far that carried a choice.
    pub fn choice_chunks(&self) -> usize {
        self.choice_chunks
    }

    /// Feed a single SSE line from the stream.
    ///
    /// Returns `Ok(Some(delta))` for a chunk carrying a choice, `Ok(None)` for
    /// everything else, or an error if the payload is malformed or the
    /// backend reported an error mid-stream.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<StreamDelta>> {
        let line = line.trim_end();

        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        // Both `data: {...}` and `data:{...}` appear in the wild.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            let message = err["message"].as_str().unwrap_or("unknown backend error");
            return Err(AgentError::LlmStreamError {
                reason: message.to_owned(),
            });
        }

        let Some(choice) = v["choices"].as_array().and_then(|c| c.first()) else {
            return Ok(None);
        };
        self.choice_chunks += 1;

        let delta = &choice["delta"];
        let content = non_empty(&delta["content"]);
        // Reasoning models use either field name depending on the server.
        let reasoning =
            non_empty(&delta["reasoning_content"]).or_else(|| non_empty(&delta["reasoning"]));
        let finish_reason = non_empty(&choice["finish_reason"]);

        Ok(Some(StreamDelta {
            content,
            reasoning,
            finish_reason,
        }))
    }
}

fn non_empty(v: &Value) -> Option<String> {
    v.as_str().filter(|s| !s.is_empty()).map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
