//! The orchestration facade.
//!
//! A [`Crew`] owns a set of personas keyed by id and drives one user turn
//! through the pipeline:
//!
//! 1. **Route** -- if a router is configured, classify the question, select
//!    the persona for the topic and hand the history over on a switch.
//! 2. **Tools** -- if a tool orchestrator is configured, resolve tool calls
//!    against the active persona's conversation.
//! 3. **Answer** -- stream the final answer through the caller's callback.
//! 4. **Compact** -- if a compactor is configured, shrink the conversation
//!    once it is over the threshold.
//!
//! A failure in steps 1-3 aborts the turn and leaves no trace in any
//! conversation.  A failure in step 4 is logged and reported in the
//! [`TurnResult`], never as an error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::agent::{CancelFlag, ChatAgent, CompletionResult, ModelSettings, StreamEvent};
use crate::compaction::{CompactionEvent, ContextCompactor, LlmSummarizer};
use crate::config::{RuntimeConfig, ToolsConfig};
use crate::error::{AgentError, Result};
use crate::llm::types::Message;
use crate::llm::{ChatBackend, LlmClient};
use crate::router::{AgentRouter, LlmTopicClassifier, RoutingDecision, hand_off};
use crate::tools::{ConfirmationGate, ToolInvoker, ToolOrchestrator, ToolRegistry, ToolRunOutcome};

// ---------------------------------------------------------------------------
// Turn result
// ---------------------------------------------------------------------------

/// Everything that happened during one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// Identifier of the turn, also recorded on the `turn` tracing span.
    pub turn_id: Uuid,
    /// Persona that answered.
    pub persona_id: String,
    /// Routing outcome, when a router is configured.
    pub routing: Option<RoutingDecision>,
    /// Tool orchestration outcome, when an orchestrator is configured.
    pub tool_run: Option<ToolRunOutcome>,
    /// The streamed answer.
    pub completion: CompletionResult,
    /// Set when the conversation was compacted after the answer.
    pub compaction: Option<CompactionEvent>,
    /// Set when compaction was attempted and failed.
    pub compaction_failure: Option<String>,
}

// ---------------------------------------------------------------------------
// Crew
// ---------------------------------------------------------------------------

/// A set of personas plus the optional routing, tool and compaction stages.
///
/// Build one with [`CrewBuilder`].
pub struct Crew {
    personas: HashMap<String, ChatAgent>,
    selected: String,
    router: Option<AgentRouter>,
    orchestrator: Option<ToolOrchestrator>,
    compactor: Option<ContextCompactor>,
    /// Shared by every turn, whichever persona ends up answering.
    cancel: CancelFlag,
}

impl std::fmt::Debug for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crew")
            .field("personas", &self.persona_ids())
            .field("selected", &self.selected)
            .field("router", &self.router)
            .field("orchestrator", &self.orchestrator)
            .field("compactor", &self.compactor)
            .finish()
    }
}

impl Crew {
    // -- Persona management --------------------------------------------------

    /// Register a persona.
    ///
    /// # Errors
    ///
    /// [`AgentError::ValidationError`] for a blank id and
    /// [`AgentError::DuplicatePersona`] when the id is taken.
    pub fn add_persona(&mut self, id: impl Into<String>, agent: ChatAgent) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "persona id must not be empty".into(),
            });
        }
        if self.personas.contains_key(&id) {
            return Err(AgentError::DuplicatePersona { persona_id: id });
        }
        info!(persona = %id, "persona added");
        self.personas.insert(id, agent);
        Ok(())
    }

    /// Remove and return a persona.  The active persona cannot be removed.
    pub fn remove_persona(&mut self, id: &str) -> Result<ChatAgent> {
        if id == self.selected {
            return Err(AgentError::ActivePersonaRemoval {
                persona_id: id.to_owned(),
            });
        }
        let agent = self
            .personas
            .remove(id)
            .ok_or_else(|| unknown_persona(id))?;
        info!(persona = %id, "persona removed");
        Ok(agent)
    }

    /// Make `id` the active persona without transferring any history.
    pub fn select_persona(&mut self, id: &str) -> Result<()> {
        if !self.personas.contains_key(id) {
            return Err(unknown_persona(id));
        }
        self.selected = id.to_owned();
        Ok(())
    }

    pub fn selected_persona_id(&self) -> &str {
        &self.selected
    }

    pub fn persona(&self, id: &str) -> Option<&ChatAgent> {
        self.personas.get(id)
    }

    pub fn persona_mut(&mut self, id: &str) -> Option<&mut ChatAgent> {
        self.personas.get_mut(id)
    }

    /// Registered ids, sorted.
    pub fn persona_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.personas.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn router(&self) -> Option<&AgentRouter> {
        self.router.as_ref()
    }

    pub fn orchestrator(&self) -> Option<&ToolOrchestrator> {
        self.orchestrator.as_ref()
    }

    pub fn compactor(&self) -> Option<&ContextCompactor> {
        self.compactor.as_ref()
    }

    // -- Active persona passthroughs -----------------------------------------

    fn active(&self) -> Result<&ChatAgent> {
        self.personas
            .get(&self.selected)
            .ok_or_else(|| unknown_persona(&self.selected))
    }

    fn active_mut(&mut self) -> Result<&mut ChatAgent> {
        let selected = &self.selected;
        self.personas
            .get_mut(selected)
            .ok_or_else(|| unknown_persona(selected))
    }

    /// Context size of the active persona's conversation.
    pub fn context_size(&self) -> usize {
        self.active().map_or(0, ChatAgent::context_size)
    }

    /// Messages of the active persona.
    pub fn messages(&self) -> &[Message] {
        match self.active() {
            Ok(agent) => agent.conversation().messages(),
            Err(_) => &[],
        }
    }

    /// Truncate the active persona's history to its system message.
    pub fn reset_messages(&mut self) {
        if let Ok(agent) = self.active_mut() {
            agent.reset_messages();
        }
    }

    /// Interrupt the in-flight turn.
    pub fn stop_stream(&self) {
        self.cancel.cancel();
    }

    /// Cancel handle for turns of this crew.
    ///
    /// The handle stays valid when routing switches persona mid-turn.  It is
    /// re-armed at the start of every turn.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn export_messages_json(&self) -> Result<String> {
        self.active()?.export_messages_json()
    }

    /// Force compaction of the active persona's conversation.
    ///
    /// # Errors
    ///
    /// [`AgentError::ConfigError`] when no compactor is configured, and any
    /// summarization failure.
    pub async fn compact_now(&mut self) -> Result<CompactionEvent> {
        let Self {
            personas,
            selected,
            compactor,
            ..
        } = self;
        let compactor = compactor.as_ref().ok_or_else(|| AgentError::ConfigError {
            reason: "no compactor configured".into(),
        })?;
        let agent = personas
            .get_mut(selected.as_str())
            .ok_or_else(|| unknown_persona(selected))?;
        compactor.compact_now(agent.conversation_mut()).await
    }

    // -- Turn pipeline -------------------------------------------------------

    /// Run one user turn, streaming the answer through `on_event`.
    ///
    /// # Errors
    ///
    /// Routing to an unregistered persona, tool orchestration failures and
    /// completion channel failures (including [`AgentError::StreamCanceled`]).
    /// On error every conversation and the persona selection are restored to
    /// their state before the turn.
    pub async fn stream_turn<F>(&mut self, question: &str, on_event: F) -> Result<TurnResult>
    where
        F: FnMut(StreamEvent<'_>) -> Result<()> + Send,
    {
        let turn_id = Uuid::now_v7();
        let span = info_span!("turn", %turn_id);
        self.run_turn(turn_id, question, on_event)
            .instrument(span)
            .await
    }

    async fn run_turn<F>(&mut self, turn_id: Uuid, question: &str, on_event: F) -> Result<TurnResult>
    where
        F: FnMut(StreamEvent<'_>) -> Result<()> + Send,
    {
        let previous = self.selected.clone();
        self.cancel.reset();

        // 1. Route.
        let routing = match &self.router {
            Some(router) => Some(router.route(question).await),
            None => None,
        };
        let target = routing
            .as_ref()
            .map_or_else(|| previous.clone(), |d| d.persona_id.clone());

        let checkpoint = self
            .personas
            .get(&target)
            .ok_or_else(|| unknown_persona(&target))?
            .conversation()
            .len();

        if target != previous {
            self.switch_persona(&previous, &target)?;
        }

        // 2 + 3. Tools, then the streamed answer.
        let (tool_run, completion) = match self.answer(question, on_event).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, persona = %target, "turn failed, rolling back");
                if let Some(agent) = self.personas.get_mut(&target) {
                    agent.conversation_mut().truncate(checkpoint);
                }
                self.selected = previous;
                return Err(e);
            }
        };

        // 4. Compact.
        let (compaction, compaction_failure) = self.compact_after_turn().await;

        info!(
            persona = %target,
            finish_reason = %completion.finish_reason,
            context_size = self.context_size(),
            "turn completed"
        );

        Ok(TurnResult {
            turn_id,
            persona_id: target,
            routing,
            tool_run,
            completion,
            compaction,
            compaction_failure,
        })
    }

    /// Select `to`, handing over `from`'s history.
    fn switch_persona(&mut self, from: &str, to: &str) -> Result<()> {
        let mut target = self.personas.remove(to).ok_or_else(|| unknown_persona(to))?;
        let transferred = match self.personas.get(from) {
            Some(source) => hand_off(source.conversation(), target.conversation_mut()),
            None => 0,
        };
        self.personas.insert(to.to_owned(), target);
        self.selected = to.to_owned();
        info!(from = %from, to = %to, transferred, "persona switched");
        Ok(())
    }

    async fn answer<F>(
        &mut self,
        question: &str,
        on_event: F,
    ) -> Result<(Option<ToolRunOutcome>, CompletionResult)>
    where
        F: FnMut(StreamEvent<'_>) -> Result<()> + Send,
    {
        let Self {
            personas,
            selected,
            orchestrator,
            cancel,
            ..
        } = self;
        let agent = personas
            .get_mut(selected.as_str())
            .ok_or_else(|| unknown_persona(selected))?;

        let user = Message::user(question);
        let (tool_run, new_messages) = match orchestrator {
            // The question and tool rounds travel with the final request,
            // so a persona without history still sees them.
            Some(orchestrator) if agent.keeps_history() => {
                let start = agent.conversation().len();
                let outcome = orchestrator
                    .resolve(agent.conversation_mut(), vec![user])
                    .await?;
                let turn_messages = agent.conversation_mut().split_off(start);
                (Some(outcome), turn_messages)
            }
            Some(orchestrator) => {
                let mut scratch = agent.scratch_conversation();
                let outcome = orchestrator.resolve(&mut scratch, vec![user]).await?;
                (Some(outcome), scratch.without_system().to_vec())
            }
            None => (None, vec![user]),
        };

        let completion = agent
            .stream_with_cancel(new_messages, cancel, on_event)
            .await?;
        Ok((tool_run, completion))
    }

    async fn compact_after_turn(&mut self) -> (Option<CompactionEvent>, Option<String>) {
        let Self {
            personas,
            selected,
            compactor,
            ..
        } = self;
        let (Some(compactor), Some(agent)) = (compactor.as_ref(), personas.get_mut(selected.as_str()))
        else {
            return (None, None);
        };

        match compactor.compact_if_needed(agent.conversation_mut()).await {
            Ok(event) => (event, None),
            Err(e) => {
                warn!(error = %e, "compaction failed, keeping full history");
                (None, Some(e.to_string()))
            }
        }
    }
}

fn unknown_persona(id: &str) -> AgentError {
    AgentError::UnknownPersona {
        persona_id: id.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Crew`].
#[derive(Default)]
pub struct CrewBuilder {
    personas: Vec<(String, ChatAgent)>,
    default_persona: Option<String>,
    router: Option<AgentRouter>,
    orchestrator: Option<ToolOrchestrator>,
    compactor: Option<ContextCompactor>,
    confirmation: Option<Arc<dyn ConfirmationGate>>,
    /// Tool stage declared by a config file, waiting for tools.
    tool_stage: Option<(Arc<dyn ChatBackend>, ToolsConfig)>,
}

impl CrewBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything `config` describes, over one shared HTTP client.
    ///
    /// Tools are code, not configuration: when the config has a `tools`
    /// section, supply them with [`with_tools`](Self::with_tools).
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let client = LlmClient::new(config.backend.client_config())?;
        Self::from_config_with_backend(config, Arc::new(client))
    }

    /// Like [`from_config`](Self::from_config) over any backend.
    pub fn from_config_with_backend(
        config: &RuntimeConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let mut builder = Self::new().default_persona(&config.default_persona);
        for (id, persona) in &config.personas {
            let agent = ChatAgent::new(
                id.as_str(),
                Arc::clone(&backend),
                persona.settings.clone(),
                persona.system_instructions.as_str(),
            )
            .with_keep_history(persona.keep_history);
            builder = builder.persona(id.as_str(), agent);
        }

        if let Some(routing) = &config.routing {
            let mut classifier =
                LlmTopicClassifier::new(Arc::clone(&backend), ModelSettings::new(&routing.model));
            if let Some(instructions) = &routing.instructions {
                classifier = classifier.with_instructions(instructions.as_str());
            }
            builder = builder.router(AgentRouter::new(
                Arc::new(classifier),
                config.routing_table(routing),
            ));
        }

        if let Some(compaction) = &config.compaction {
            let summarizer =
                LlmSummarizer::new(Arc::clone(&backend), ModelSettings::new(&compaction.model))
                    .with_prompt(compaction.prompt);
            builder = builder.compactor(
                ContextCompactor::new(Arc::new(summarizer)).with_threshold(compaction.threshold),
            );
        }

        builder.tool_stage = config
            .tools
            .as_ref()
            .map(|tools| (Arc::clone(&backend), tools.clone()));

        Ok(builder)
    }

    pub fn persona(mut self, id: impl Into<String>, agent: ChatAgent) -> Self {
        self.personas.push((id.into(), agent));
        self
    }

    /// Initially selected persona.  Defaults to the first one added.
    pub fn default_persona(mut self, id: impl Into<String>) -> Self {
        self.default_persona = Some(id.into());
        self
    }

    pub fn router(mut self, router: AgentRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn tool_orchestrator(mut self, orchestrator: ToolOrchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn compactor(mut self, compactor: ContextCompactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Gate every tool call behind `gate`.
    pub fn confirmation(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.confirmation = Some(gate);
        self
    }

    /// Attach tools to the stage declared by the config's `tools` section.
    ///
    /// # Errors
    ///
    /// [`AgentError::ConfigError`] if the builder was not created from a
    /// config with a `tools` section.
    pub fn with_tools(mut self, registry: ToolRegistry, invoker: Arc<dyn ToolInvoker>) -> Result<Self> {
        let (backend, tools) = self.tool_stage.take().ok_or_else(|| AgentError::ConfigError {
            reason: "no tools section configured".into(),
        })?;
        self.orchestrator = Some(
            ToolOrchestrator::new(backend, tools.settings(), registry, invoker)
                .with_mode(tools.mode)
                .with_max_rounds(tools.max_rounds),
        );
        Ok(self)
    }

    /// Assemble the crew.
    ///
    /// # Errors
    ///
    /// No personas, duplicate or blank ids, or an unknown default persona.
    pub fn build(self) -> Result<Crew> {
        let Some(first) = self.personas.first().map(|(id, _)| id.clone()) else {
            return Err(AgentError::ConfigError {
                reason: "a crew needs at least one persona".into(),
            });
        };
        let selected = self.default_persona.unwrap_or(first);

        if self.tool_stage.is_some() {
            warn!("tools section configured but no tools attached; tool stage disabled");
        }

        let orchestrator = match (self.orchestrator, self.confirmation) {
            (Some(orchestrator), Some(gate)) => Some(orchestrator.with_confirmation(gate)),
            (orchestrator, _) => orchestrator,
        };

        let mut crew = Crew {
            personas: HashMap::with_capacity(self.personas.len()),
            selected: selected.clone(),
            router: self.router,
            orchestrator,
            compactor: self.compactor,
            cancel: CancelFlag::default(),
        };
        for (id, agent) in self.personas {
            crew.add_persona(id, agent)?;
        }
        if !crew.personas.contains_key(&selected) {
            return Err(unknown_persona(&selected));
        }

        info!(
            personas = crew.personas.len(),
            selected = %crew.selected,
            routing = crew.router.is_some(),
            tools = crew.orchestrator.is_some(),
            compaction = crew.compactor.is_some(),
            "crew assembled"
        );
        Ok(crew)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Completion, StreamDelta};
    use crate::test_support::ScriptedBackend;

    fn agent(backend: &Arc<ScriptedBackend>, name: &str) -> ChatAgent {
        ChatAgent::new(
            name,
            backend.clone(),
            ModelSettings::new("chat"),
            format!("You are {name}."),
        )
    }

    fn two_persona_crew(backend: &Arc<ScriptedBackend>) -> Crew {
        CrewBuilder::new()
            .persona("bob", agent(backend, "bob"))
            .persona("alice", agent(backend, "alice"))
            .build()
            .unwrap()
    }

    #[test]
    fn persona_management_rules() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut crew = two_persona_crew(&backend);

        assert_eq!(crew.selected_persona_id(), "bob");
        assert_eq!(crew.persona_ids(), vec!["alice", "bob"]);

        assert!(matches!(
            crew.add_persona("bob", agent(&backend, "bob")),
            Err(AgentError::DuplicatePersona { .. })
        ));
        assert!(crew.add_persona("  ", agent(&backend, "x")).is_err());
        assert!(matches!(
            crew.remove_persona("bob"),
            Err(AgentError::ActivePersonaRemoval { .. })
        ));
        assert!(matches!(
            crew.remove_persona("carol"),
            Err(AgentError::UnknownPersona { .. })
        ));
        assert!(crew.select_persona("carol").is_err());

        crew.select_persona("alice").unwrap();
        assert_eq!(crew.remove_persona("bob").unwrap().name(), "bob");
        assert_eq!(crew.persona_ids(), vec!["alice"]);
    }

    #[test]
    fn builder_rejects_empty_and_unknown_default() {
        assert!(CrewBuilder::new().build().is_err());

        let backend = Arc::new(ScriptedBackend::new());
        let err = CrewBuilder::new()
            .persona("bob", agent(&backend, "bob"))
            .default_persona("ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownPersona { .. }));
    }

    #[tokio::test]
    async fn plain_turn_streams_and_appends() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_text_stream(&["Hi ", "Amy"]);
        let mut crew = two_persona_crew(&backend);

        let mut streamed = String::new();
        let result = crew
            .stream_turn("hello", |event| {
                if let StreamEvent::Content(c) = event {
                    streamed.push_str(c);
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(streamed, "Hi Amy");
        assert_eq!(result.persona_id, "bob");
        assert_eq!(result.completion.finish_reason, "stop");
        assert!(result.routing.is_none() && result.tool_run.is_none());
        assert_eq!(crew.messages().len(), 3);
        assert_eq!(crew.messages()[2], Message::assistant("Hi Amy"));
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_trace() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_stream(vec![
            Ok(StreamDelta::content("partial")),
            Err(AgentError::LlmStreamError {
                reason: "connection reset".into(),
            }),
        ]);
        let mut crew = two_persona_crew(&backend);

        let err = crew.stream_turn("hello", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmStreamError { .. }));
        assert_eq!(crew.messages().len(), 1);
    }

    #[tokio::test]
    async fn orchestrator_failure_rolls_back_user_message() {
        let backend = Arc::new(ScriptedBackend::new());
        // No completion scripted: the orchestrator's first request fails.
        let orchestrator = ToolOrchestrator::new(
            backend.clone(),
            ModelSettings::new("tools"),
            ToolRegistry::new(),
            Arc::new(crate::tools::invoke_fn(|_, _| Ok(serde_json::Value::Null))),
        );
        let mut crew = CrewBuilder::new()
            .persona("bob", agent(&backend, "bob"))
            .tool_orchestrator(orchestrator)
            .build()
            .unwrap();

        assert!(crew.stream_turn("hello", |_| Ok(())).await.is_err());
        assert_eq!(crew.messages().len(), 1);
    }

    #[tokio::test]
    async fn compact_now_requires_a_compactor() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut crew = two_persona_crew(&backend);
        assert!(matches!(
            crew.compact_now().await,
            Err(AgentError::ConfigError { .. })
        ));
    }

    #[tokio::test]
    async fn crew_from_config_wires_every_stage() {
        let config = RuntimeConfig::from_toml_str(
            r#"
default_persona = "generic"
[personas.generic]
model = "m"
system_instructions = "generic"
[personas.chef]
model = "m"
system_instructions = "chef"
[routing]
model = "classifier"
routes = [{ topics = ["cooking"], persona = "chef" }]
[tools]
mode = "loop"
[compaction]
threshold = 100000
"#,
        )
        .unwrap();

        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_completion(Ok(Completion::text(r#"{"topic_discussion":"cooking"}"#)))
            .push_completion(Ok(Completion::text("no tools needed")))
            .push_text_stream(&["Bake it."]);

        let mut crew = CrewBuilder::from_config_with_backend(&config, backend.clone())
            .unwrap()
            .with_tools(
                ToolRegistry::new(),
                Arc::new(crate::tools::invoke_fn(|_, _| Ok(serde_json::Value::Null))),
            )
            .unwrap()
            .build()
            .unwrap();

        assert!(crew.router().is_some());
        assert!(crew.orchestrator().is_some());
        assert_eq!(crew.compactor().unwrap().threshold(), 100000);

        let result = crew.stream_turn("how do I make bread?", |_| Ok(())).await.unwrap();
        assert_eq!(result.persona_id, "chef");
        assert_eq!(result.routing.unwrap().topic.as_deref(), Some("cooking"));
        assert!(result.compaction.is_none());
        assert_eq!(crew.selected_persona_id(), "chef");

        // Classifier, tool round, final stream.
        let requests = backend.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].model, "classifier");
        assert_eq!(
            crew.messages(),
            &[
                Message::system("chef"),
                Message::user("how do I make bread?"),
                Message::assistant("Bake it."),
            ]
        );
    }

    #[test]
    fn with_tools_needs_a_tools_section() {
        let result = CrewBuilder::new().with_tools(
            ToolRegistry::new(),
            Arc::new(crate::tools::invoke_fn(|_, _| Ok(serde_json::Value::Null))),
        );
        assert!(matches!(result, Err(AgentError::ConfigError { .. })));
    }
}
