//! Tools for toolpilot.
//!
//! The [`ToolCatalog`] unifies three kinds of tools behind one naming
//! scheme: built-in tools compiled into the binary, stored tools authored by
//! the user and run in a subprocess, and tools advertised by remote MCP
//! servers (`mcp_<server>_<tool>`). Every definition passes through
//! [`schema::sanitize_definitions`] before it reaches a model.

pub mod catalog;
pub mod clock;
pub mod mcp;
pub mod mcp_client;
pub mod schema;
pub mod stored;
pub mod weather;

pub use catalog::{ToolCatalog, ToolKind};
pub use mcp::{NormalizedOutput, normalize_protocol_result, parse_mcp_tool_name};
pub use mcp_client::McpClientManager;
pub use stored::{StoredTool, SubprocessEvaluator};

use toolpilot_core::tool::ToolRegistry;

/// A registry with every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(weather::WeatherTool)
        .with(clock::ClockTool)
}
