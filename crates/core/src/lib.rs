//! # toolpilot Core
//!
//! Domain types, traits, and error definitions for the toolpilot
//! tool-calling orchestrator. This crate performs **no I/O**; it defines
//! the domain model that the transport, tool, and agent crates implement
//! against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`Provider`]: the transport client that talks to a language model
//! - [`ProtocolToolClient`]: a client for remote tool-protocol servers
//! - [`ScriptEvaluator`]: the sandbox that runs user-authored tool bodies
//! - [`Tool`]: a built-in, in-process tool
//!
//! Implementations live in their respective crates, and tests substitute
//! scripted mocks.

pub mod agent;
pub mod artifact;
pub mod error;
pub mod event;
pub mod message;
pub mod protocol;
pub mod provider;
pub mod sandbox;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::AgentPolicy;
pub use artifact::Artifact;
pub use error::{Error, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use protocol::{
    ContentPart, ProtocolToolCall, ProtocolToolClient, ProtocolToolInfo, ProtocolToolResult,
    ServerAvailability,
};
pub use provider::{
    BackendProfile, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use sandbox::{ScriptEvaluator, ScriptInvocation};
pub use tool::{Tool, ToolRegistry, ToolResult};
