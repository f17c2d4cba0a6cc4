//! Shared fixtures for the integration tests: in-memory backends that never
//! touch the network, and tracing setup.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use parley_agent::{AgentError, ChatBackend, ChatRequest, Completion, DeltaStream, Result, StreamDelta};

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn exhausted() -> AgentError {
    AgentError::LlmRequestFailed {
        reason: "script exhausted".into(),
    }
}

/// Replays queued completions and streams in order, recording requests.
#[derive(Default)]
pub struct ScriptedBackend {
    completions: Mutex<VecDeque<Result<Completion>>>,
    streams: Mutex<VecDeque<Vec<Result<StreamDelta>>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, completion: Completion) -> &Self {
        self.completions.lock().unwrap().push_back(Ok(completion));
        self
    }

    pub fn push_failure(&self, error: AgentError) -> &Self {
        self.completions.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn push_stream(&self, deltas: Vec<Result<StreamDelta>>) -> &Self {
        self.streams.lock().unwrap().push_back(deltas);
        self
    }

    /// Content chunks followed by a `stop` finish chunk.
    pub fn push_text_stream(&self, chunks: &[&str]) -> &Self {
        let mut deltas: Vec<Result<StreamDelta>> =
            chunks.iter().map(|c| Ok(StreamDelta::content(*c))).collect();
        deltas.push(Ok(StreamDelta::finish("stop")));
        self.push_stream(deltas)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
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
            .unwrap_or_else(|| Err(exhausted()))
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        self.requests.lock().unwrap().push(request.clone());
        let deltas = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(exhausted)?;
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// Answers every request by calling a function of the request, so replies
/// can depend on what the conversation already contains.
pub struct ResponderBackend<F> {
    respond: F,
    requests: Mutex<Vec<ChatRequest>>,
}

impl<F> ResponderBackend<F>
where
    F: Fn(&ChatRequest) -> Completion + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl<F> ChatBackend for ResponderBackend<F>
where
    F: Fn(&ChatRequest) -> Completion + Send + Sync,
{
    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        Ok((self.respond)(request))
    }

    /// Streams the completion content word by word.
    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        self.requests.lock().unwrap().push(request.clone());
        let completion = (self.respond)(request);
        let mut deltas: Vec<Result<StreamDelta>> = completion
            .content
            .split_inclusive(' ')
            .map(|word| Ok(StreamDelta::content(word)))
            .collect();
        deltas.push(Ok(StreamDelta::finish(completion.finish_reason)));
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}
