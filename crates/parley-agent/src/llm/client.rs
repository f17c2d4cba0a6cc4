//! HTTP client for OpenAI-compatible chat completion endpoints.
//!
//! Works against the OpenAI API itself and against local engines that speak
//! the same protocol (llama.cpp server, Ollama, vLLM, Docker Model Runner)
//! in both streaming SSE and non-streaming modes.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::backend::{ChatBackend, DeltaStream};
use crate::llm::streaming::OpenAiStreamParser;
use crate::llm::types::{ChatRequest, Completion, Message, Role, StreamDelta, ToolCall, ToolDefinition};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default OpenAI API base URL.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Configuration for connecting to one chat completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// API key for authentication.  Empty for local engines that need none.
    pub api_key: String,
    /// Base URL for the API (e.g. `https://api.openai.com/v1`).
    pub base_url: String,
    /// Model used when a request leaves `model` empty.
    pub default_model: String,
    /// Default maximum tokens per response.
    pub max_tokens: u32,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl LlmClientConfig {
    /// Create a configuration for the OpenAI API.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::openai_compatible(api_key, model, OPENAI_BASE_URL)
    }

    /// Create a configuration for any OpenAI-compatible API.
    pub fn openai_compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            default_model: model.into(),
            max_tokens: 4096,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A [`ChatBackend`] speaking the OpenAI Chat Completions protocol.
///
/// Cheap to clone; clones share the HTTP connection pool.  The API key can be
/// hot-swapped at runtime via [`update_api_key`](Self::update_api_key).
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: Arc<LlmClientConfig>,
    api_key: Arc<RwLock<String>>,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a new client with the given configuration.
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(AgentError::ConfigError {
                reason: "backend base_url must not be empty".into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            api_key: Arc::new(RwLock::new(config.api_key.clone())),
            config: Arc::new(config),
            http,
        })
    }

    /// The model used when a request does not name one.
    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Hot-swap the API key at runtime.
    pub fn update_api_key(&self, new_key: String) {
        if let Ok(mut key) = self.api_key.write() {
            *key = new_key;
        }
    }

    /// Read the current API key (snapshot).
    fn current_api_key(&self) -> String {
        self.api_key
            .read()
            .map(|k| k.clone())
            .unwrap_or_else(|_| self.config.api_key.clone())
    }

    // -- Request building ----------------------------------------------------

    /// Build the JSON body for the Chat Completions API.
    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let model = if request.model.is_empty() {
            self.config.default_model.as_str()
        } else {
            request.model.as_str()
        };

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages_to_openai(&request.messages),
        });

        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        if !request.tools.is_empty() {
            body["tools"] = tools_to_openai(&request.tools);
        }

        if let Some(format) = &request.response_format {
            body["response_format"] = format.clone();
        }

        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    /// Send the HTTP request and fail on non-success status codes.
    async fn send_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let api_key = self.current_api_key();
        if !api_key.is_empty() {
            let auth_value = format!("Bearer {api_key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value).map_err(|e| AgentError::LlmRequestFailed {
                    reason: format!("invalid authorization header: {e}"),
                })?,
            );
        }

        tracing::debug!(url = %url, model = %body["model"], stream = body["stream"].as_bool().unwrap_or(false), "sending LLM request");

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let body = self.build_request_body(request, false);
        let resp = self.send_request(&body).await?;

        let text = resp
            .text()
            .await
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to read response body: {e}"),
            })?;

        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;

        parse_openai_response(&v)
    }

    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        let body = self.build_request_body(request, true);
        let resp = self.send_request(&body).await?;

        let state = SseDeltas {
            bytes: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buffer: Vec::new(),
            parser: OpenAiStreamParser::new(),
            ready: VecDeque::new(),
            finished: false,
        };

        Ok(Box::pin(futures::stream::unfold(state, next_delta)))
    }
}

// ---------------------------------------------------------------------------
// SSE byte stream to delta stream
// ---------------------------------------------------------------------------

/// State threaded through [`next_delta`] while a response body is consumed.
struct SseDeltas {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    /// Bytes of an incomplete trailing line.  Kept as bytes so a multi-byte
    /// character split across network chunks is decoded intact.
    buffer: Vec<u8>,
    parser: OpenAiStreamParser,
    ready: VecDeque<StreamDelta>,
    finished: bool,
}

impl SseDeltas {
    /// Parse every complete line currently buffered.
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.feed(&line)?;
            if self.parser.is_done() {
                self.finished = true;
                self.buffer.clear();
                break;
            }
        }
        Ok(())
    }

    fn feed(&mut self, line: &[u8]) -> Result<()> {
        let line = std::str::from_utf8(line).map_err(|e| AgentError::LlmStreamError {
            reason: format!("invalid UTF-8 in stream: {e}"),
        })?;
        if let Some(delta) = self.parser.feed_line(line)? {
            self.ready.push_back(delta);
        }
        Ok(())
    }
}

async fn next_delta(mut state: SseDeltas) -> Option<(Result<StreamDelta>, SseDeltas)> {
    loop {
        if let Some(delta) = state.ready.pop_front() {
            return Some((Ok(delta), state));
        }
        if state.finished {
            return None;
        }

        let step = match state.bytes.next().await {
            Some(Ok(chunk)) => {
                state.buffer.extend_from_slice(&chunk);
                state.drain_lines()
            }
            Some(Err(e)) => Err(AgentError::LlmStreamError {
                reason: format!("stream read error: {e}"),
            }),
            None => {
                state.finished = true;
                let rest = std::mem::take(&mut state.buffer);
                state.feed(&rest)
            }
        };

        if let Err(e) = step {
            state.finished = true;
            state.ready.clear();
            return Some((Err(e), state));
        }
    }
}

// ===========================================================================
// Format conversion (free functions)
// ===========================================================================

/// Convert internal messages to the OpenAI wire format.
///
/// System messages are part of the `messages` array, tool calls live in
/// `assistant.tool_calls` with string arguments, and tool results use
/// `role: "tool"` with a `tool_call_id`.
pub fn messages_to_openai(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let tool_calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments,
                            }
                        })
                    })
                    .collect();

                let mut m = json!({
                    "role": "assistant",
                    "tool_calls": tool_calls,
                });
                if !msg.content.is_empty() {
                    m["content"] = json!(msg.content);
                }
                m
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            }),
            role => json!({
                "role": role.as_str(),
                "content": msg.content,
            }),
        })
        .collect()
}

/// Convert tool definitions into the function-calling format.
///
/// Each tool is wrapped in `{"type": "function", "function": {...}}`.
pub fn tools_to_openai(tools: &[ToolDefinition]) -> Value {
    let tool_values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema(),
                }
            })
        })
        .collect();
    json!(tool_values)
}

/// Parse a non-streaming Chat Completions response into a [`Completion`].
pub fn parse_openai_response(v: &Value) -> Result<Completion> {
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        return Err(AgentError::LlmRequestFailed {
            reason: err["message"]
                .as_str()
                .unwrap_or("unknown backend error")
                .to_owned(),
        });
    }

    let Some(choice) = v["choices"].as_array().and_then(|c| c.first()) else {
        return Err(AgentError::EmptyCompletion);
    };

    let message = &choice["message"];
    if message.is_null() {
        return Err(AgentError::LlmParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let func = &tc["function"];
                    // Arguments stay raw; some servers send an object instead
                    // of the string the protocol specifies.
                    let arguments = match &func["arguments"] {
                        Value::String(s) => s.clone(),
                        Value::Null => "{}".to_owned(),
                        other => other.to_string(),
                    };
                    ToolCall {
                        id: tc["id"].as_str().unwrap_or_default().to_owned(),
                        name: func["name"].as_str().unwrap_or_default().to_owned(),
                        arguments,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let reasoning = message["reasoning_content"]
        .as_str()
        .or_else(|| message["reasoning"].as_str())
        .unwrap_or_default();

    Ok(Completion {
        content: message["content"].as_str().unwrap_or_default().to_owned(),
        reasoning: reasoning.to_owned(),
        tool_calls,
        finish_reason: choice["finish_reason"]
            .as_str()
            .unwrap_or_default()
            .to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
