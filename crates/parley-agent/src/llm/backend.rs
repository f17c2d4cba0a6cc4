//! The seam between the runtime and the inference engine.
//!
//! Everything above this trait (personas, the tool orchestrator, the
//! summarizer and the topic classifier) talks to the model through
//! [`ChatBackend`], so the HTTP client can be swapped for an in-memory script
//! in tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::llm::types::{ChatRequest, Completion, StreamDelta};

/// A stream of incremental chunks for one streamed completion.
///
/// Dropping the stream abandons the underlying response.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// An inference endpoint able to answer chat requests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send a request and wait for the fully materialized completion.
    ///
    /// A response without any choice must be reported as
    /// [`AgentError::EmptyCompletion`](crate::AgentError::EmptyCompletion).
    async fn complete(&self, request: &ChatRequest) -> Result<Completion>;

    /// Open a streamed completion.
    ///
    /// Errors establishing the stream are returned directly; errors while
    /// reading it are yielded as stream items.
    async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream>;
}
