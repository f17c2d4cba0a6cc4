//! Tool-call orchestration.
//!
//! The [`ToolOrchestrator`] asks the backend for a completion with the
//! registered tools attached, and when the answer carries tool calls it
//! confirms, executes and reports them back as tool-role messages.  Three
//! strategies are supported (see [`ToolCallMode`]):
//!
//! ```text
//!  IDLE ─> AWAITING_COMPLETION ─┬─> NO_CALLS ─> DONE
//!                ^              └─> CALLS_DETECTED ─> CONFIRMING ─> EXECUTING ─┐
//!                └────────────────────────── (loop mode) ─────────────────────┘
//!                                    any pass may end in ABORTED
//! ```
//!
//! Ordinary tool failures never surface as errors: they are serialized into
//! the tool message so the model can react.  Only [`ToolError::Abort`] or an
//! [`Confirmation::AbortAll`] verdict ends a run early, and even then the run
//! itself succeeds with [`ToolRunOutcome::stop`] set.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::agent::ModelSettings;
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, Message, ToolCall};
use crate::llm::ChatBackend;
use crate::tools::invoker::{Confirmation, ConfirmationGate, ToolError, ToolInvoker};
use crate::tools::registry::ToolRegistry;

// ---------------------------------------------------------------------------
// Result contents
// ---------------------------------------------------------------------------

const DENIED_RESULT: &str =
    r#"{"status": "denied", "message": "Tool execution was denied by user"}"#;
const QUIT_RESULT: &str = r#"{"status": "quit", "message": "Tool execution was quit by user"}"#;
const EMPTY_RESULT: &str = r#"{"error": "Function execution returned empty result"}"#;

fn failure_result(message: &str) -> String {
    json!({ "error": format!("Function execution failed: {message}") }).to_string()
}

fn aborted_result(reason: &str) -> String {
    json!({ "status": "aborted", "message": reason }).to_string()
}

/// Tool message content for a successful invocation, `None` when empty.
fn success_content(value: Value) -> Option<String> {
    let content = match value {
        Value::Null => return None,
        Value::String(s) => s,
        other => other.to_string(),
    };
    (!content.trim().is_empty()).then_some(content)
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Strategy used by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallMode {
    /// One completion; its calls run one after another; no follow-up round.
    SingleShot,
    /// Repeat completion and execution until a call-free answer.
    #[default]
    Loop,
    /// One completion; its calls run concurrently behind a join barrier.
    Parallel,
}

/// Why a run ended before reaching a call-free answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The invoker raised [`ToolError::Abort`].
    ToolAbort { tool_name: String, reason: String },
    /// The confirmation gate answered [`Confirmation::AbortAll`].
    UserAbort { tool_name: String },
}

/// Control decision after one pass over a batch of calls.
#[derive(Debug)]
pub enum LoopControl {
    /// Ask the backend again.
    Continue,
    /// End the run early, successfully.
    Stop(StopReason),
    /// End the run with an error.
    Fail(AgentError),
}

/// What happened to one pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Ran and produced a result.
    Executed,
    /// Ran (or could not run) and failed; the failure is in the content.
    Failed,
    /// Denied by the confirmation gate.
    Denied,
    /// The call on which the gate answered abort-all.
    Quit,
    /// Never considered because the batch had already been stopped.
    Skipped,
    /// The invoker raised the abort sentinel for this call.
    Aborted,
}

/// One call and the tool message content produced for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub call: ToolCall,
    pub status: CallStatus,
    pub content: String,
}

impl ToolCallRecord {
    fn new(call: &ToolCall, status: CallStatus, content: impl Into<String>) -> Self {
        Self {
            call: call.clone(),
            status,
            content: content.into(),
        }
    }
}

/// Summary of one orchestration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRunOutcome {
    /// Backend round trips performed.
    pub rounds: u32,
    /// Every call seen, in backend order across all rounds.
    pub records: Vec<ToolCallRecord>,
    /// Most recent non-empty assistant text.
    pub last_assistant_message: String,
    /// Finish reason of the last completion.
    pub finish_reason: String,
    /// Set when the run was stopped early.
    pub stop: Option<StopReason>,
}

impl ToolRunOutcome {
    /// Whether at least one call actually ran.
    pub fn executed_any(&self) -> bool {
        self.records
            .iter()
            .any(|r| matches!(r.status, CallStatus::Executed | CallStatus::Failed))
    }

    /// Contents of the executed calls, in order.
    pub fn results(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.status == CallStatus::Executed)
            .map(|r| r.content.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives tool calls for a conversation.
pub struct ToolOrchestrator {
    backend: Arc<dyn ChatBackend>,
    settings: ModelSettings,
    registry: ToolRegistry,
    invoker: Arc<dyn ToolInvoker>,
    confirmation: Option<Arc<dyn ConfirmationGate>>,
    mode: ToolCallMode,
    max_rounds: u32,
}

impl std::fmt::Debug for ToolOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOrchestrator")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("mode", &self.mode)
            .field("confirmation", &self.confirmation.is_some())
            .field("max_rounds", &self.max_rounds)
            .finish()
    }
}

impl ToolOrchestrator {
    /// Default safety cap on loop rounds.
    pub const DEFAULT_MAX_ROUNDS: u32 = 20;

    /// Create an orchestrator in [`ToolCallMode::Loop`] without confirmation.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        settings: ModelSettings,
        registry: ToolRegistry,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            backend,
            settings,
            registry,
            invoker,
            confirmation: None,
            mode: ToolCallMode::default(),
            max_rounds: Self::DEFAULT_MAX_ROUNDS,
        }
    }

    /// Select the strategy.
    pub fn with_mode(mut self, mode: ToolCallMode) -> Self {
        self.mode = mode;
        self
    }

    /// Gate every call behind `gate`.
    pub fn with_confirmation(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.confirmation = Some(gate);
        self
    }

    /// Cap the number of backend round trips in loop mode.
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// The configured strategy.
    pub fn mode(&self) -> ToolCallMode {
        self.mode
    }

    /// The registered tools.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Append `new_messages` and orchestrate until the strategy ends.
    ///
    /// A call-free completion is stored as the final assistant message.
    ///
    /// # Errors
    ///
    /// Backend failures and [`AgentError::MaxRoundsExceeded`].  On error the
    /// conversation is rolled back to its length before the call.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        new_messages: Vec<Message>,
    ) -> Result<ToolRunOutcome> {
        self.drive(conversation, new_messages, true).await
    }

    /// Like [`run`](Self::run), but a call-free completion is not stored:
    /// the caller streams the final answer itself.
    pub async fn resolve(
        &self,
        conversation: &mut Conversation,
        new_messages: Vec<Message>,
    ) -> Result<ToolRunOutcome> {
        self.drive(conversation, new_messages, false).await
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        new_messages: Vec<Message>,
        keep_final: bool,
    ) -> Result<ToolRunOutcome> {
        let checkpoint = conversation.len();
        let result = self.drive_rounds(conversation, new_messages, keep_final).await;
        if let Err(e) = &result {
            warn!(error = %e, mode = ?self.mode, "tool orchestration failed, rolling back");
            conversation.truncate(checkpoint);
        }
        result
    }

    async fn drive_rounds(
        &self,
        conversation: &mut Conversation,
        new_messages: Vec<Message>,
        keep_final: bool,
    ) -> Result<ToolRunOutcome> {
        conversation.extend(new_messages);
        let mut outcome = ToolRunOutcome::default();

        while outcome.rounds < self.max_rounds {
            let request = ChatRequest {
                tools: self.registry.definitions().to_vec(),
                ..self.settings.request(conversation.messages().to_vec())
            };
            let completion = self.backend.complete(&request).await?;
            outcome.rounds += 1;
            outcome.finish_reason = completion.finish_reason.clone();
            if !completion.content.is_empty() {
                outcome.last_assistant_message = completion.content.clone();
            }

            if completion.tool_calls.is_empty() {
                debug!(rounds = outcome.rounds, "no tool calls detected");
                if keep_final {
                    conversation.push(Message::assistant(completion.content));
                }
                return Ok(outcome);
            }

            info!(
                round = outcome.rounds,
                mode = ?self.mode,
                tools = ?completion.tool_calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                "tool calls detected"
            );

            let calls = completion.tool_calls;
            conversation.push(Message::assistant_tool_calls(
                completion.content,
                calls.clone(),
            ));

            let (records, control) = match self.mode {
                ToolCallMode::Parallel => self.execute_parallel(&calls).await,
                ToolCallMode::SingleShot | ToolCallMode::Loop => {
                    self.execute_sequential(&calls).await
                }
            };

            for record in &records {
                conversation.push(Message::tool_result(&record.call.id, &record.content));
            }
            outcome.records.extend(records);

            match control {
                LoopControl::Continue if self.mode == ToolCallMode::Loop => continue,
                LoopControl::Continue => return Ok(outcome),
                LoopControl::Stop(reason) => {
                    info!(?reason, rounds = outcome.rounds, "tool orchestration stopped early");
                    outcome.stop = Some(reason);
                    return Ok(outcome);
                }
                LoopControl::Fail(e) => return Err(e),
            }
        }

        Err(AgentError::MaxRoundsExceeded {
            max_rounds: self.max_rounds,
        })
    }

    async fn confirm(&self, call: &ToolCall) -> Confirmation {
        match &self.confirmation {
            Some(gate) => gate.confirm(&call.name, &call.arguments).await,
            None => Confirmation::Approve,
        }
    }

    /// Confirm and execute calls one at a time.
    async fn execute_sequential(&self, calls: &[ToolCall]) -> (Vec<ToolCallRecord>, LoopControl) {
        let mut records = Vec::with_capacity(calls.len());

        for (i, call) in calls.iter().enumerate() {
            let stop = match self.confirm(call).await {
                Confirmation::Approve => {
                    let (record, abort) =
                        invoke_call(self.invoker.as_ref(), self.registry.contains(&call.name), call)
                            .await;
                    records.push(record);
                    abort.map(|reason| StopReason::ToolAbort {
                        tool_name: call.name.clone(),
                        reason,
                    })
                }
                Confirmation::Deny => {
                    warn!(tool = %call.name, "tool call denied");
                    records.push(ToolCallRecord::new(call, CallStatus::Denied, DENIED_RESULT));
                    None
                }
                Confirmation::AbortAll => {
                    warn!(tool = %call.name, "tool calls aborted by confirmation gate");
                    records.push(ToolCallRecord::new(call, CallStatus::Quit, QUIT_RESULT));
                    Some(StopReason::UserAbort {
                        tool_name: call.name.clone(),
                    })
                }
            };

            if let Some(reason) = stop {
                records.extend(skip_remaining(&calls[i + 1..]));
                return (records, LoopControl::Stop(reason));
            }
        }

        (records, LoopControl::Continue)
    }

    /// Confirm every call in order, then execute the approved ones
    /// concurrently and wait for all of them.
    async fn execute_parallel(&self, calls: &[ToolCall]) -> (Vec<ToolCallRecord>, LoopControl) {
        let mut slots: Vec<Option<ToolCallRecord>> = (0..calls.len()).map(|_| None).collect();
        let mut approved = Vec::with_capacity(calls.len());
        let mut stop: Option<StopReason> = None;

        for (i, call) in calls.iter().enumerate() {
            if stop.is_some() {
                slots[i] = Some(ToolCallRecord::new(call, CallStatus::Skipped, DENIED_RESULT));
                continue;
            }
            match self.confirm(call).await {
                Confirmation::Approve => approved.push(i),
                Confirmation::Deny => {
                    warn!(tool = %call.name, "tool call denied");
                    slots[i] = Some(ToolCallRecord::new(call, CallStatus::Denied, DENIED_RESULT));
                }
                Confirmation::AbortAll => {
                    warn!(tool = %call.name, "tool calls aborted by confirmation gate");
                    slots[i] = Some(ToolCallRecord::new(call, CallStatus::Quit, QUIT_RESULT));
                    stop = Some(StopReason::UserAbort {
                        tool_name: call.name.clone(),
                    });
                }
            }
        }

        let handles: Vec<_> = approved
            .into_iter()
            .map(|i| {
                let invoker = Arc::clone(&self.invoker);
                let known = self.registry.contains(&calls[i].name);
                let call = calls[i].clone();
                let handle =
                    tokio::spawn(async move { invoke_call(invoker.as_ref(), known, &call).await });
                (i, handle)
            })
            .collect();

        let mut first_abort: Option<StopReason> = None;
        for (i, handle) in handles {
            match handle.await {
                Ok((record, abort)) => {
                    if first_abort.is_none()
                        && let Some(reason) = abort
                    {
                        first_abort = Some(StopReason::ToolAbort {
                            tool_name: record.call.name.clone(),
                            reason,
                        });
                    }
                    slots[i] = Some(record);
                }
                Err(e) => {
                    let err = AgentError::Internal(format!("tool execution task panicked: {e}"));
                    return (slots.into_iter().flatten().collect(), LoopControl::Fail(err));
                }
            }
        }

        let records: Vec<ToolCallRecord> = slots.into_iter().flatten().collect();

        if stop.is_none() {
            stop = first_abort;
        }

        let control = match stop {
            Some(reason) => LoopControl::Stop(reason),
            None => LoopControl::Continue,
        };
        (records, control)
    }
}

/// Denial records for calls left unprocessed after a stop.
fn skip_remaining(calls: &[ToolCall]) -> impl Iterator<Item = ToolCallRecord> + '_ {
    calls
        .iter()
        .map(|call| ToolCallRecord::new(call, CallStatus::Skipped, DENIED_RESULT))
}

/// Execute one approved call and turn every outcome into a record.
///
/// The second element carries the invoker's reason when it raised the abort
/// sentinel.
async fn invoke_call(
    invoker: &dyn ToolInvoker,
    known: bool,
    call: &ToolCall,
) -> (ToolCallRecord, Option<String>) {
    if !known {
        warn!(tool = %call.name, "backend requested an unregistered tool");
        let content = failure_result(&format!("unknown tool `{}`", call.name));
        return (ToolCallRecord::new(call, CallStatus::Failed, content), None);
    }

    debug!(tool = %call.name, id = %call.id, "executing tool");
    let record = match invoker.invoke(&call.name, &call.arguments).await {
        Ok(value) => match success_content(value) {
            Some(content) => ToolCallRecord::new(call, CallStatus::Executed, content),
            None => {
                warn!(tool = %call.name, "tool returned an empty result");
                ToolCallRecord::new(call, CallStatus::Failed, EMPTY_RESULT)
            }
        },
        Err(ToolError::Failed(message)) => {
            warn!(tool = %call.name, error = %message, "tool execution failed");
            ToolCallRecord::new(call, CallStatus::Failed, failure_result(&message))
        }
        Err(ToolError::Abort(reason)) => {
            info!(tool = %call.name, %reason, "tool requested orchestration abort");
            let record = ToolCallRecord::new(call, CallStatus::Aborted, aborted_result(&reason));
            return (record, Some(reason));
        }
    };
    (record, None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::types::{Completion, ParamType, Role, ToolDefinition};
    use crate::test_support::ScriptedBackend;
    use crate::tools::invoker::{confirm_fn, invoke_fn};

    fn registry() -> ToolRegistry {
        ToolRegistry::with_tools([
            ToolDefinition::new("add")
                .with_parameter("a", ParamType::Number, "a", true)
                .with_parameter("b", ParamType::Number, "b", true),
            ToolDefinition::new("echo").with_parameter("text", ParamType::String, "text", true),
            ToolDefinition::new("fail"),
            ToolDefinition::new("stop"),
            ToolDefinition::new("nothing"),
        ])
        .unwrap()
    }

    fn invoker() -> Arc<dyn ToolInvoker> {
        Arc::new(invoke_fn(|name, args| {
            let v: Value = serde_json::from_str(args).unwrap_or(Value::Null);
            match name {
                "add" => Ok(json!(v["a"].as_i64().unwrap_or(0) + v["b"].as_i64().unwrap_or(0))),
                "echo" => Ok(Value::String(v["text"].as_str().unwrap_or_default().to_owned())),
                "fail" => Err(ToolError::Failed("disk full".into())),
                "stop" => Err(ToolError::Abort("user asked to exit".into())),
                _ => Ok(Value::Null),
            }
        }))
    }

    fn orchestrator(backend: Arc<ScriptedBackend>, mode: ToolCallMode) -> ToolOrchestrator {
        ToolOrchestrator::new(backend, ModelSettings::new("tools"), registry(), invoker())
            .with_mode(mode)
    }

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall::new(id, name, args)
    }

    #[tokio::test]
    async fn loop_grows_two_messages_per_round_plus_final() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_completion(Ok(Completion::tool_calls(vec![call("1", "add", r#"{"a":2,"b":2}"#)])))
            .push_completion(Ok(Completion::tool_calls(vec![call("2", "echo", r#"{"text":"hi"}"#)])))
            .push_completion(Ok(Completion::text("4 and hi")));
        let orch = orchestrator(backend.clone(), ToolCallMode::Loop);

        let mut conv = Conversation::new("sys");
        let outcome = orch.run(&mut conv, vec![Message::user("go")]).await.unwrap();

        let k = 2;
        assert_eq!(conv.len(), 1 + 1 + 2 * k + 1);
        assert_eq!(outcome.rounds, 3);
        assert_eq!(backend.requests().len(), 3);
        assert_eq!(outcome.results(), vec!["4", "hi"]);
        assert_eq!(outcome.finish_reason, "stop");
        assert_eq!(conv.last().unwrap(), &Message::assistant("4 and hi"));
        assert!(outcome.stop.is_none());

        // Tools travel with every round.
        assert_eq!(backend.requests()[0].tools.len(), 5);
    }

    #[tokio::test]
    async fn tool_failure_is_serialized_and_loop_continues() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_completion(Ok(Completion::tool_calls(vec![call("1", "fail", "{}")])))
            .push_completion(Ok(Completion::text("sorry")));
        let orch = orchestrator(backend, ToolCallMode::Loop);

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert_eq!(outcome.records[0].status, CallStatus::Failed);
        let tool_msg = &conv.messages()[2];
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("1"));
        let v: Value = serde_json::from_str(&tool_msg.content).unwrap();
        assert_eq!(v["error"], "Function execution failed: disk full");
        assert_eq!(outcome.rounds, 2);
    }

    #[tokio::test]
    async fn abort_sentinel_stops_the_loop_without_failing() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion {
            content: "working on it".into(),
            ..Completion::tool_calls(vec![
                call("1", "echo", r#"{"text":"a"}"#),
                call("2", "stop", "{}"),
                call("3", "echo", r#"{"text":"b"}"#),
            ])
        }));
        let orch = orchestrator(backend.clone(), ToolCallMode::Loop);

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert_eq!(
            outcome.stop,
            Some(StopReason::ToolAbort {
                tool_name: "stop".into(),
                reason: "user asked to exit".into(),
            })
        );
        assert_eq!(outcome.records[1].content, aborted_result("user asked to exit"));
        assert_eq!(outcome.last_assistant_message, "working on it");
        assert_eq!(backend.requests().len(), 1);

        let statuses: Vec<CallStatus> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![CallStatus::Executed, CallStatus::Aborted, CallStatus::Skipped]
        );
        // user + assistant + one tool message per call
        assert_eq!(conv.len(), 5);
        assert_eq!(conv.messages()[4].content, DENIED_RESULT);
    }

    #[tokio::test]
    async fn parallel_abort_reports_the_invoker_reason() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![
            call("1", "echo", r#"{"text":"a"}"#),
            call("2", "stop", "{}"),
            call("3", "add", r#"{"a":1,"b":2}"#),
        ])));
        let orch = orchestrator(backend, ToolCallMode::Parallel);

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert_eq!(
            outcome.stop,
            Some(StopReason::ToolAbort {
                tool_name: "stop".into(),
                reason: "user asked to exit".into(),
            })
        );
        assert_eq!(
            outcome.records[1].content,
            r#"{"status":"aborted","message":"user asked to exit"}"#
        );
        let statuses: Vec<CallStatus> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![CallStatus::Executed, CallStatus::Aborted, CallStatus::Executed]
        );
    }

    #[tokio::test]
    async fn single_shot_runs_one_pass() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![
            call("1", "add", r#"{"a":1,"b":1}"#),
            call("2", "echo", r#"{"text":"x"}"#),
        ])));
        let orch = orchestrator(backend.clone(), ToolCallMode::SingleShot);

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert_eq!(outcome.rounds, 1);
        assert_eq!(backend.requests().len(), 1);
        assert_eq!(conv.len(), 1 + 1 + 2);
        assert_eq!(outcome.results(), vec!["2", "x"]);
    }

    #[tokio::test]
    async fn call_free_completion_is_final_answer_unless_resolving() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_completion(Ok(Completion::text("plain answer")))
            .push_completion(Ok(Completion::text("plain answer")));
        let orch = orchestrator(backend, ToolCallMode::SingleShot);

        let mut kept = Conversation::new("");
        orch.run(&mut kept, vec![Message::user("q")]).await.unwrap();
        assert_eq!(kept.len(), 2);

        let mut resolved = Conversation::new("");
        let outcome = orch.resolve(&mut resolved, vec![Message::user("q")]).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(!outcome.executed_any());
        assert_eq!(outcome.last_assistant_message, "plain answer");
    }

    struct SlowInvoker;

    #[async_trait]
    impl ToolInvoker for SlowInvoker {
        async fn invoke(&self, _tool_name: &str, arguments: &str) -> std::result::Result<Value, ToolError> {
            let v: Value = serde_json::from_str(arguments).unwrap_or(Value::Null);
            let delay = v["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!(format!("done after {delay}")))
        }
    }

    #[tokio::test]
    async fn parallel_batch_keeps_backend_order_with_one_denied() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![
            call("a", "echo", r#"{"delay_ms":40}"#),
            call("b", "add", r#"{"delay_ms":0}"#),
            call("c", "echo", r#"{"delay_ms":5}"#),
        ])));

        let gate = confirm_fn(|name, _| {
            if name == "add" {
                Confirmation::Deny
            } else {
                Confirmation::Approve
            }
        });
        let orch = ToolOrchestrator::new(
            backend.clone(),
            ModelSettings::default(),
            registry(),
            Arc::new(SlowInvoker),
        )
        .with_mode(ToolCallMode::Parallel)
        .with_confirmation(Arc::new(gate));

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert_eq!(backend.requests().len(), 1);
        let added = &conv.messages()[1..];
        assert_eq!(added.len(), 4);
        assert_eq!(added[0].role, Role::Assistant);
        let ids: Vec<&str> = added[1..]
            .iter()
            .map(|m| m.tool_call_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(added[1].content, "done after 40");
        assert_eq!(added[2].content, DENIED_RESULT);
        assert_eq!(added[3].content, "done after 5");
        assert_eq!(outcome.results().len(), 2);
    }

    #[tokio::test]
    async fn abort_all_marks_remaining_calls_denied() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![
            call("1", "echo", r#"{"text":"ok"}"#),
            call("2", "add", r#"{"a":1,"b":2}"#),
            call("3", "echo", r#"{"text":"never"}"#),
        ])));
        let gate = confirm_fn(|name, _| {
            if name == "add" {
                Confirmation::AbortAll
            } else {
                Confirmation::Approve
            }
        });
        let orch = orchestrator(backend.clone(), ToolCallMode::Loop)
            .with_confirmation(Arc::new(gate));

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert_eq!(
            outcome.stop,
            Some(StopReason::UserAbort {
                tool_name: "add".into()
            })
        );
        assert_eq!(backend.requests().len(), 1);
        let contents: Vec<&str> = conv.messages()[2..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["ok", QUIT_RESULT, DENIED_RESULT]);
    }

    #[tokio::test]
    async fn parallel_abort_all_still_runs_calls_approved_before_it() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![
            call("1", "echo", r#"{"text":"first"}"#),
            call("2", "add", "{}"),
            call("3", "echo", r#"{"text":"third"}"#),
        ])));
        let gate = confirm_fn(|name, _| match name {
            "add" => Confirmation::AbortAll,
            _ => Confirmation::Approve,
        });
        let orch = orchestrator(backend, ToolCallMode::Parallel).with_confirmation(Arc::new(gate));

        let mut conv = Conversation::new("");
        let outcome = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        let statuses: Vec<CallStatus> = outcome.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![CallStatus::Executed, CallStatus::Quit, CallStatus::Skipped]
        );
        assert!(matches!(outcome.stop, Some(StopReason::UserAbort { .. })));
    }

    #[tokio::test]
    async fn unknown_tool_and_empty_result_are_reported_in_content() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![
            call("1", "launch_rocket", "{}"),
            call("2", "nothing", "{}"),
        ])));
        let orch = orchestrator(backend, ToolCallMode::SingleShot);

        let mut conv = Conversation::new("");
        orch.run(&mut conv, vec![Message::user("x")]).await.unwrap();

        assert!(conv.messages()[2].content.contains("unknown tool `launch_rocket`"));
        assert_eq!(conv.messages()[3].content, EMPTY_RESULT);
    }

    #[tokio::test]
    async fn backend_failure_rolls_the_conversation_back() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(Ok(Completion::tool_calls(vec![call(
            "1",
            "add",
            r#"{"a":1,"b":1}"#,
        )])));
        // Second round: script exhausted -> request failure.
        let orch = orchestrator(backend, ToolCallMode::Loop);

        let mut conv = Conversation::new("sys");
        let err = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap_err();

        assert!(matches!(err, AgentError::LlmRequestFailed { .. }));
        assert_eq!(conv.len(), 1);
    }

    #[tokio::test]
    async fn loop_hits_round_cap() {
        let backend = Arc::new(ScriptedBackend::new());
        for i in 0..3 {
            backend.push_completion(Ok(Completion::tool_calls(vec![call(
                &i.to_string(),
                "echo",
                r#"{"text":"again"}"#,
            )])));
        }
        let orch = orchestrator(backend, ToolCallMode::Loop).with_max_rounds(2);

        let mut conv = Conversation::new("");
        let err = orch.run(&mut conv, vec![Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxRoundsExceeded { max_rounds: 2 }));
        assert!(conv.is_empty());
    }

    #[test]
    fn success_content_rules() {
        assert_eq!(success_content(json!("plain")), Some("plain".into()));
        assert_eq!(success_content(json!({"x": 1})), Some(r#"{"x":1}"#.into()));
        assert_eq!(success_content(json!("  ")), None);
        assert_eq!(success_content(Value::Null), None);
    }
}
