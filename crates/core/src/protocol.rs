//! Remote tool-protocol abstraction.
//!
//! Protocol tool servers advertise callable tools over a standardized
//! exchange (MCP). The agent only sees them through [`ProtocolToolClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ToolError;

/// A tool advertised by a protocol server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolToolInfo {
    /// The server that advertises the tool
    pub server: String,

    /// Tool name as known to the server
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of the tool's input, as reported by the server
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// A request to run a tool on a protocol server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolToolCall {
    /// The model's tool-call id
    pub id: String,
    pub server: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One part of a multi-part protocol result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// "text", "image", "resource", or anything else a server invents
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Base64 payload for binary parts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            kind: "image".into(),
            data: Some(data.into()),
            mime_type: Some(mime_type.into()),
            ..Default::default()
        }
    }
}

/// The outcome of a protocol tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolToolResult {
    pub success: bool,

    #[serde(default)]
    pub content: Vec<ContentPart>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Reachability of configured protocol servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerAvailability {
    pub available: Vec<String>,

    /// Unreachable servers with the reason
    pub unavailable: Vec<(String, String)>,

    pub total_tools: usize,
}

/// A client for remote tool-protocol servers.
#[async_trait]
pub trait ProtocolToolClient: Send + Sync {
    /// Tools advertised by the servers in `server_filter` (all servers when empty).
    async fn list_available_tools(
        &self,
        server_filter: &[String],
    ) -> std::result::Result<Vec<ProtocolToolInfo>, ToolError>;

    /// Run one tool call.
    async fn invoke(&self, call: ProtocolToolCall) -> std::result::Result<ProtocolToolResult, ToolError>;

    /// Which of the servers in `server_filter` can be reached.
    async fn availability(&self, server_filter: &[String]) -> ServerAvailability;
}
