//! MCP client: connects to configured protocol tool servers.
//!
//! Servers are reached over stdio (child process) or streamable HTTP and are
//! connected lazily, the first time their tools are listed or called. A
//! server that fails to connect is reported as unavailable and retried on
//! the next request.

use std::collections::HashMap;

use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    model::{CallToolRequestParams, ListToolsResult},
};
use tokio::sync::RwLock;
use toolpilot_config::McpServerConfig;
use toolpilot_core::error::ToolError;
use toolpilot_core::{
    ContentPart, ProtocolToolCall, ProtocolToolClient, ProtocolToolInfo, ProtocolToolResult,
    ServerAvailability,
};
use tracing::{debug, info, warn};

use crate::mcp::mcp_tool_name;

type McpClientService = rmcp::service::RunningService<rmcp::service::RoleClient, ()>;

struct Connection {
    service: McpClientService,
    tools: Vec<ProtocolToolInfo>,
}

/// Connections to every enabled MCP server in the configuration.
pub struct McpClientManager {
    servers: Vec<McpServerConfig>,
    connections: RwLock<HashMap<String, Connection>>,
}

impl McpClientManager {
    pub fn new(servers: Vec<McpServerConfig>) -> Self {
        Self {
            servers: servers.into_iter().filter(|s| s.enabled).collect(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Names of the configured (enabled) servers.
    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }

    fn selected<'a>(&'a self, server_filter: &'a [String]) -> impl Iterator<Item = &'a McpServerConfig> {
        self.servers
            .iter()
            .filter(move |s| server_filter.is_empty() || server_filter.iter().any(|f| f == &s.name))
    }

    async fn ensure_connected(&self, entry: &McpServerConfig) -> Result<(), ToolError> {
        if self.connections.read().await.contains_key(&entry.name) {
            return Ok(());
        }

        let connection = connect(entry).await?;
        info!(
            server = %entry.name,
            transport = %entry.transport,
            tools = connection.tools.len(),
            "Connected to MCP server"
        );
        self.connections
            .write()
            .await
            .insert(entry.name.clone(), connection);
        Ok(())
    }

    async fn drop_connection(&self, server: &str) {
        if let Some(connection) = self.connections.write().await.remove(server) {
            let _ = connection.service.cancel().await;
            debug!(server = %server, "Dropped MCP connection");
        }
    }

    /// Disconnect from every server.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.write().await;
        for (name, connection) in connections.drain() {
            let _ = connection.service.cancel().await;
            info!(server = %name, "Disconnected from MCP server");
        }
    }
}

#[async_trait]
impl ProtocolToolClient for McpClientManager {
    async fn list_available_tools(
        &self,
        server_filter: &[String],
    ) -> Result<Vec<ProtocolToolInfo>, ToolError> {
        let mut tools = Vec::new();
        for entry in self.selected(server_filter) {
            if let Err(e) = self.ensure_connected(entry).await {
                warn!(server = %entry.name, error = %e, "MCP server unavailable");
                continue;
            }
            if let Some(connection) = self.connections.read().await.get(&entry.name) {
                tools.extend(connection.tools.iter().cloned());
            }
        }
        Ok(tools)
    }

    async fn invoke(&self, call: ProtocolToolCall) -> Result<ProtocolToolResult, ToolError> {
        let entry = self
            .servers
            .iter()
            .find(|s| s.name == call.server)
            .ok_or_else(|| ToolError::NotFound(mcp_tool_name(&call.server, &call.name)))?;

        self.ensure_connected(entry).await?;

        let outcome = {
            let connections = self.connections.read().await;
            let connection = connections
                .get(&entry.name)
                .ok_or_else(|| ToolError::Protocol(format!("server '{}' not connected", entry.name)))?;

            if !connection.tools.iter().any(|t| t.name == call.name) {
                return Err(ToolError::NotFound(mcp_tool_name(&call.server, &call.name)));
            }

            debug!(server = %call.server, tool = %call.name, call_id = %call.id, "Calling MCP tool");
            connection
                .service
                .call_tool(CallToolRequestParams {
                    meta: None,
                    name: call.name.clone().into(),
                    arguments: call.arguments.as_object().cloned(),
                    task: None,
                })
                .await
        };

        match outcome {
            Ok(result) => {
                let value = serde_json::to_value(&result)
                    .map_err(|e| ToolError::Protocol(format!("unreadable tool result: {e}")))?;
                Ok(protocol_result_from_value(&value))
            }
            Err(e) => {
                // The session may be gone; reconnect on the next attempt.
                self.drop_connection(&entry.name).await;
                Err(ToolError::Protocol(format!(
                    "call to '{}' on '{}' failed: {e}",
                    call.name, call.server
                )))
            }
        }
    }

    async fn availability(&self, server_filter: &[String]) -> ServerAvailability {
        let mut report = ServerAvailability::default();
        for entry in self.selected(server_filter) {
            match self.ensure_connected(entry).await {
                Ok(()) => {
                    report.available.push(entry.name.clone());
                    if let Some(connection) = self.connections.read().await.get(&entry.name) {
                        report.total_tools += connection.tools.len();
                    }
                }
                Err(e) => report.unavailable.push((entry.name.clone(), e.to_string())),
            }
        }
        report
    }
}

async fn connect(entry: &McpServerConfig) -> Result<Connection, ToolError> {
    let service = match entry.transport.as_str() {
        "stdio" => {
            let command = entry
                .command
                .as_ref()
                .ok_or_else(|| ToolError::Protocol(format!("server '{}' has no command", entry.name)))?;

            let mut cmd = tokio::process::Command::new(command);
            cmd.args(&entry.args);
            for (key, value) in &entry.env {
                cmd.env(key, value);
            }

            let transport = rmcp::transport::TokioChildProcess::new(cmd)
                .map_err(|e| ToolError::Protocol(format!("failed to spawn '{command}': {e}")))?;
            ().serve(transport)
                .await
                .map_err(|e| ToolError::Protocol(format!("handshake with '{}' failed: {e}", entry.name)))?
        }
        "http" | "streamable-http" => {
            let url = entry
                .url
                .as_ref()
                .ok_or_else(|| ToolError::Protocol(format!("server '{}' has no url", entry.name)))?;

            let transport = rmcp::transport::StreamableHttpClientTransport::from_uri(url.as_str());
            ().serve(transport)
                .await
                .map_err(|e| ToolError::Protocol(format!("handshake with '{}' failed: {e}", entry.name)))?
        }
        other => return Err(ToolError::Protocol(format!("unknown transport '{other}'"))),
    };

    let listing = service
        .list_tools(Default::default())
        .await
        .map_err(|e| ToolError::Protocol(format!("tools/list on '{}' failed: {e}", entry.name)))?;

    Ok(Connection {
        tools: extract_tools(&entry.name, &listing),
        service,
    })
}

fn extract_tools(server: &str, listing: &ListToolsResult) -> Vec<ProtocolToolInfo> {
    listing
        .tools
        .iter()
        .map(|t| ProtocolToolInfo {
            server: server.to_string(),
            name: t.name.to_string(),
            description: t.description.as_ref().map(|s| s.to_string()).unwrap_or_default(),
            input_schema: serde_json::to_value(&t.input_schema).unwrap_or_default(),
        })
        .collect()
}

/// Read a `tools/call` result in its wire shape.
fn protocol_result_from_value(value: &serde_json::Value) -> ProtocolToolResult {
    let content: Vec<ContentPart> = value
        .get("content")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();
    let is_error = value.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);

    let error = is_error.then(|| {
        let text: Vec<&str> = content.iter().filter_map(|p| p.text.as_deref()).collect();
        if text.is_empty() {
            "MCP tool reported an error".to_string()
        } else {
            text.join("\n")
        }
    });

    ProtocolToolResult {
        success: !is_error,
        content,
        error,
        metadata: value.get("structuredContent").cloned(),
    }
}
