//! The agent loop behind every toolpilot chat message.
//!
//! A message runs through a **Think → Act → Observe** cycle:
//!
//! 1. **Collect** the tools on offer (built-in, stored scripts, MCP servers)
//! 2. **Ask** the model, streaming where the backend allows it
//! 3. **If tool calls**: run each one with retries, answer it, loop back to 2
//! 4. **If text only**: assemble the reply envelope and return it
//!
//! The loop also stops when the step budget runs out, when too many steps
//! fail, or when the caller cancels.

pub mod assembler;
pub mod context;
pub mod invoker;
pub mod loop_runner;
pub mod prompt;
pub mod service;
pub mod turn;

#[cfg(test)]
mod test_helpers;

pub use assembler::{AssistantReply, ReplyMetadata, ResultsSummary};
pub use context::{AgentExecutionContext, ProgressCallback, ToolExecutionAttempt};
pub use invoker::{RetryPolicy, ToolInvoker, ToolOutcome};
pub use loop_runner::{AgentLoop, LoopOutcome, LoopRequest, Termination};
pub use service::{ChatRequest, ChatService, ChatSettings};
pub use turn::{TransportMode, TurnExecutor, select_transport_mode};

pub use tokio_util::sync::CancellationToken;
