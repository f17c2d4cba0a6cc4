//! Tool declaration, execution boundaries and orchestration.
//!
//! - [`registry`] -- Unique-name registry of [`ToolDefinition`](crate::llm::ToolDefinition)s.
//! - [`invoker`] -- The [`ToolInvoker`] and [`ConfirmationGate`] boundaries.
//! - [`orchestrator`] -- Single-shot, loop and parallel tool-call strategies.

pub mod invoker;
pub mod orchestrator;
pub mod registry;

pub use invoker::{
    ConfirmFn, Confirmation, ConfirmationGate, InvokeFn, ToolError, ToolInvoker, confirm_fn,
    invoke_fn,
};
pub use orchestrator::{
    CallStatus, LoopControl, StopReason, ToolCallMode, ToolCallRecord, ToolOrchestrator,
    ToolRunOutcome,
};
pub use registry::ToolRegistry;
