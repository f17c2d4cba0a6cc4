//! In-memory backend used by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::llm::{ChatBackend, ChatRequest, Completion, DeltaStream, StreamDelta};

/// Replays queued completions and streams, recording every request.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    completions: Mutex<VecDeque<Result<Completion>>>,
    streams: Mutex<VecDeque<Vec<Result<StreamDelta>>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_completion(&self, completion: Result<Completion>) -> &Self {
        self.completions.lock().unwrap().push_back(completion);
        self
    }

    pub(crate) fn push_stream(&self, deltas: Vec<Result<StreamDelta>>) -> &Self {
        self.streams.lock().unwrap().push_back(deltas);
        self
    }

    /// Convenience: a stream of content chunks followed by `stop`.
    pub(crate) fn push_text_stream(&self, chunks: &[&str]) -> &Self {
        let mut deltas: Vec<Result<StreamDelta>> =
            chunks.iter().map(|c| Ok(StreamDelta::content(*c))).collect();
        deltas.push(Ok(StreamDelta::finish("stop")));
        self.push_stream(deltas)
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::LlmRequestFailed {
                reason: "script exhausted".into(),
            }))
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        self.requests.lock().unwrap().push(request.clone());
        let deltas = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::LlmRequestFailed {
                reason: "script exhausted".into(),
            })?;
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}
