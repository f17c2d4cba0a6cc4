//! Topic-based persona routing.
//!
//! The [`AgentRouter`] asks a [`TopicClassifier`] for the one-word topic of
//! the latest user text, then looks the topic up in a [`RoutingTable`] to
//! pick the persona that should answer.  Classification failure is never
//! fatal: the table's default persona is used instead.
//!
//! When the selection changes between turns, [`hand_off`] copies the
//! previous persona's history (minus its system message) into the new one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::ModelSettings;
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, Message};
use crate::llm::ChatBackend;

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

/// Topics served by one persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub topics: Vec<String>,
    #[serde(alias = "agent")]
    pub persona: String,
}

/// Topic to persona map with a default fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default, alias = "routing")]
    pub routes: Vec<Route>,
    #[serde(alias = "default_agent")]
    pub default_persona: String,
}

impl RoutingTable {
    pub fn new(default_persona: impl Into<String>) -> Self {
        Self {
            routes: Vec::new(),
            default_persona: default_persona.into(),
        }
    }

    /// Add a route; later routes never shadow earlier ones for a topic.
    pub fn with_route<I, S>(mut self, topics: I, persona: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.push(Route {
            topics: topics.into_iter().map(Into::into).collect(),
            persona: persona.into(),
        });
        self
    }

    /// The persona for `topic`; matching is case-insensitive and ignores
    /// surrounding whitespace.  Unknown or empty topics get the default.
    pub fn persona_for_topic(&self, topic: &str) -> &str {
        let topic = topic.trim().to_lowercase();
        if topic.is_empty() {
            return &self.default_persona;
        }
        self.routes
            .iter()
            .find(|route| route.topics.iter().any(|t| t.trim().to_lowercase() == topic))
            .map_or(self.default_persona.as_str(), |route| route.persona.as_str())
    }

    /// Every persona id the table can return.
    pub fn persona_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.default_persona.as_str())
            .chain(self.routes.iter().map(|r| r.persona.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Classification boundary
// ---------------------------------------------------------------------------

/// Detects the one-word topic of a piece of user text.
#[async_trait]
pub trait TopicClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<String>;
}

/// Default instructions for [`LlmTopicClassifier`].
pub const CLASSIFIER_INSTRUCTIONS: &str = "You identify the main topic of the user's message. \
     Answer with a JSON object of the form {\"topic_discussion\": \"<topic>\"} where <topic> is \
     a single lowercase word.";

/// Structured answer expected from the classifying model.
#[derive(Debug, Deserialize)]
struct Intent {
    topic_discussion: String,
}

/// [`TopicClassifier`] backed by a chat model with JSON output.
pub struct LlmTopicClassifier {
    backend: Arc<dyn ChatBackend>,
    settings: ModelSettings,
    instructions: String,
}

impl std::fmt::Debug for LlmTopicClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmTopicClassifier")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LlmTopicClassifier {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: ModelSettings) -> Self {
        Self {
            backend,
            settings,
            instructions: CLASSIFIER_INSTRUCTIONS.to_owned(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    fn request(&self, text: &str) -> ChatRequest {
        ChatRequest {
            response_format: Some(json!({ "type": "json_object" })),
            ..self.settings.request(vec![
                Message::system(self.instructions.clone()),
                Message::user(text),
            ])
        }
    }
}

#[async_trait]
impl TopicClassifier for LlmTopicClassifier {
    async fn classify(&self, text: &str) -> Result<String> {
        let completion = self
            .backend
            .complete(&self.request(text))
            .await
            .map_err(|e| AgentError::ClassificationFailed {
                reason: e.to_string(),
            })?;

        let intent = parse_intent(&completion.content)?;
        debug!(topic = %intent.topic_discussion, "topic classified");
        Ok(intent.topic_discussion)
    }
}

/// Parse the classifier answer, tolerating text around the JSON object.
fn parse_intent(content: &str) -> Result<Intent> {
    let trimmed = content.trim();
    let object = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(object).map_err(|e| AgentError::ClassificationFailed {
        reason: format!("invalid classifier answer {trimmed:?}: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Outcome of routing one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    /// Persona that should answer.
    pub persona_id: String,
    /// Detected topic; `None` when classification failed.
    pub topic: Option<String>,
}

/// Classifier plus routing table.
pub struct AgentRouter {
    classifier: Arc<dyn TopicClassifier>,
    table: RoutingTable,
}

impl std::fmt::Debug for AgentRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRouter")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl AgentRouter {
    pub fn new(classifier: Arc<dyn TopicClassifier>, table: RoutingTable) -> Self {
        Self { classifier, table }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Pick the persona for `text`.  Never fails.
    pub async fn route(&self, text: &str) -> RoutingDecision {
        match self.classifier.classify(text).await {
            Ok(topic) => {
                let persona_id = self.table.persona_for_topic(&topic).to_owned();
                info!(%topic, persona = %persona_id, "turn routed");
                RoutingDecision {
                    persona_id,
                    topic: Some(topic),
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    persona = %self.table.default_persona,
                    "topic classification failed, using default persona"
                );
                RoutingDecision {
                    persona_id: self.table.default_persona.clone(),
                    topic: None,
                }
            }
        }
    }
}

/// Copy `from`'s history, without its leading system message, onto the end
/// of `to`.  Returns the number of messages transferred.
pub fn hand_off(from: &Conversation, to: &mut Conversation) -> usize {
    let transferred = from.without_system();
    to.extend(transferred.iter().cloned());
    transferred.len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
