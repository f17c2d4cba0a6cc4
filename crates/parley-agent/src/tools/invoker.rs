//! Boundaries between the orchestrator and the outside world: tool execution
//! and human (or policy) confirmation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Tool execution
// ---------------------------------------------------------------------------

/// Failure raised by a [`ToolInvoker`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    /// The tool failed.  The message is serialized into the tool result and
    /// the conversation carries on.
    #[error("{0}")]
    Failed(String),

    /// Stop the orchestration loop after this call.
    #[error("orchestration aborted: {0}")]
    Abort(String),
}

/// Executes tool calls on behalf of the orchestrator.
///
/// Implementations receive the tool name and the raw JSON argument string
/// exactly as the backend produced it.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute `tool_name` with `arguments`.
    ///
    /// A `Value::String` result is used verbatim as the tool message content;
    /// any other value is serialized as JSON.
    async fn invoke(&self, tool_name: &str, arguments: &str) -> Result<Value, ToolError>;
}

/// Adapter turning a plain closure into a [`ToolInvoker`].
pub struct InvokeFn<F>(F);

/// Wrap a synchronous closure as a [`ToolInvoker`].
pub fn invoke_fn<F>(f: F) -> InvokeFn<F>
where
    F: Fn(&str, &str) -> Result<Value, ToolError> + Send + Sync,
{
    InvokeFn(f)
}

#[async_trait]
impl<F> ToolInvoker for InvokeFn<F>
where
    F: Fn(&str, &str) -> Result<Value, ToolError> + Send + Sync,
{
    async fn invoke(&self, tool_name: &str, arguments: &str) -> Result<Value, ToolError> {
        (self.0)(tool_name, arguments)
    }
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Verdict of a confirmation gate for one pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// Execute the call.
    Approve,
    /// Skip the call and report a denial to the backend.
    Deny,
    /// Skip this call and every remaining call, ending the orchestration.
    AbortAll,
}

/// Decides whether a pending tool call may run.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    /// Inspect the call and return a verdict.
    async fn confirm(&self, tool_name: &str, arguments: &str) -> Confirmation;
}

/// Adapter turning a plain closure into a [`ConfirmationGate`].
pub struct ConfirmFn<F>(F);

/// Wrap a synchronous closure as a [`ConfirmationGate`].
pub fn confirm_fn<F>(f: F) -> ConfirmFn<F>
where
    F: Fn(&str, &str) -> Confirmation + Send + Sync,
{
    ConfirmFn(f)
}

#[async_trait]
impl<F> ConfirmationGate for ConfirmFn<F>
where
    F: Fn(&str, &str) -> Confirmation + Send + Sync,
{
    async fn confirm(&self, tool_name: &str, arguments: &str) -> Confirmation {
        (self.0)(tool_name, arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_invoker_passes_name_and_raw_arguments() {
        let invoker = invoke_fn(|name, args| Ok(json!({"tool": name, "args": args})));
        let value = invoker.invoke("say_hello", r#"{"name":"Amy"}"#).await.unwrap();
        assert_eq!(value["tool"], "say_hello");
        assert_eq!(value["args"], r#"{"name":"Amy"}"#);
    }

    #[tokio::test]
    async fn closure_gate_returns_verdict() {
        let gate = confirm_fn(|name, _| {
            if name == "rm" {
                Confirmation::Deny
            } else {
                Confirmation::Approve
            }
        });
        assert_eq!(gate.confirm("rm", "{}").await, Confirmation::Deny);
        assert_eq!(gate.confirm("ls", "{}").await, Confirmation::Approve);
    }

    #[test]
    fn confirmation_deserializes_snake_case() {
        let c: Confirmation = serde_json::from_str(r#""abort_all""#).unwrap();
        assert_eq!(c, Confirmation::AbortAll);
    }
}
