//! Tool catalog: one view over built-in, stored and protocol tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use toolpilot_config::AppConfig;
use toolpilot_core::{ProtocolToolInfo, ToolDefinition, ToolRegistry};
use tracing::debug;

use crate::mcp::{mcp_tool_name, parse_mcp_tool_name};
use crate::schema::sanitize_definitions;
use crate::stored::StoredTool;

/// Where a tool's implementation lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolKind {
    Builtin,
    StoredScript,
    RemoteProtocol { server: String, tool: String },
}

/// All tools available to one conversation.
pub struct ToolCatalog {
    builtin: Arc<ToolRegistry>,
    stored: BTreeMap<String, StoredTool>,
    protocol: BTreeMap<String, ProtocolToolInfo>,
}

impl ToolCatalog {
    pub fn new(builtin: impl Into<Arc<ToolRegistry>>) -> Self {
        Self {
            builtin: builtin.into(),
            stored: BTreeMap::new(),
            protocol: BTreeMap::new(),
        }
    }

    /// Built-in tools plus the enabled stored tools of `config`.
    pub fn from_config(builtin: impl Into<Arc<ToolRegistry>>, config: &AppConfig) -> Self {
        let mut catalog = Self::new(builtin);
        for tool in config.stored_tools.iter().filter(|t| t.enabled) {
            catalog.add_stored(StoredTool::from_config(tool));
        }
        catalog
    }

    pub fn add_stored(&mut self, tool: StoredTool) {
        self.stored.insert(tool.name.clone(), tool);
    }

    /// Add tools advertised by protocol servers under their `mcp_` names.
    pub fn add_protocol_tools(&mut self, tools: Vec<ProtocolToolInfo>) {
        for info in tools {
            let name = mcp_tool_name(&info.server, &info.name);
            debug!(tool = %name, "Registered protocol tool");
            self.protocol.insert(name, info);
        }
    }

    /// Sanitized definitions of every tool, in resolution order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let protocol = self.protocol.iter().map(|(name, info)| ToolDefinition {
            name: name.clone(),
            description: info.description.clone(),
            parameters: info.input_schema.clone(),
        });
        let stored = self
            .stored
            .values()
            .filter(|t| !self.builtin.contains(&t.name))
            .map(StoredTool::to_definition);

        sanitize_definitions(
            protocol
                .chain(self.builtin.definitions())
                .chain(stored)
                .collect(),
        )
    }

    /// The sanitized definition for one tool name.
    pub fn lookup(&self, name: &str) -> Option<ToolDefinition> {
        self.definitions().into_iter().find(|d| d.name == name)
    }

    /// Resolve a name: `mcp_` prefix first, then built-ins, then stored tools.
    pub fn kind_of(&self, name: &str) -> Option<ToolKind> {
        if let Some((server, tool)) = parse_mcp_tool_name(name) {
            return Some(ToolKind::RemoteProtocol {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }
        if self.builtin.contains(name) {
            return Some(ToolKind::Builtin);
        }
        if self.stored.contains_key(name) {
            return Some(ToolKind::StoredScript);
        }
        None
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions().into_iter().map(|d| d.name).collect()
    }

    pub fn builtin(&self) -> &ToolRegistry {
        &self.builtin
    }

    pub fn stored(&self, name: &str) -> Option<&StoredTool> {
        self.stored.get(name)
    }

    pub fn protocol_tool(&self, name: &str) -> Option<&ProtocolToolInfo> {
        self.protocol.get(name)
    }

    pub fn protocol_tool_count(&self) -> usize {
        self.protocol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builtin.is_empty() && self.stored.is_empty() && self.protocol.is_empty()
    }
}
