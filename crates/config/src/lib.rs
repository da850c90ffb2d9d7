//! Configuration loading, validation, and management for toolpilot.
//!
//! Loads configuration from `~/.toolpilot/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use toolpilot_core::AgentPolicy;

/// The root configuration structure.
///
/// Maps directly to `~/.toolpilot/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model; may carry a `provider:` prefix
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Base system prompt; a default persona is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Sampling parameters
    #[serde(default)]
    pub parameters: ParametersConfig,

    /// Feature switches
    #[serde(default)]
    pub features: FeaturesConfig,

    /// Agent loop policy
    #[serde(default)]
    pub agent: AgentPolicy,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Remote tool-protocol servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerConfig>,

    /// Servers whose tools are offered to the model; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_enabled_servers: Vec<String>,

    /// User-authored tools evaluated in a subprocess
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stored_tools: Vec<StoredToolConfig>,
}

fn default_provider() -> String {
    "ollama".into()
}
fn default_model() -> String {
    "qwen3:8b".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> Option<u32> {
    Some(4096)
}
fn default_true() -> bool {
    true
}
fn default_interpreter() -> Vec<String> {
    vec!["sh".into(), "-s".into()]
}
fn default_tool_timeout() -> u64 {
    30
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("system_prompt", &self.system_prompt)
            .field("parameters", &self.parameters)
            .field("features", &self.features)
            .field("agent", &self.agent)
            .field("providers", &self.providers)
            .field("mcp_servers", &self.mcp_servers)
            .field("mcp_enabled_servers", &self.mcp_enabled_servers)
            .field("stored_tools", &self.stored_tools)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametersConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for ParametersConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_true")]
    pub enable_streaming: bool,

    #[serde(default = "default_true")]
    pub enable_tools: bool,

    #[serde(default = "default_true")]
    pub enable_mcp: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            enable_streaming: true,
            enable_tools: true,
            enable_mcp: true,
        }
    }
}

/// One configured model backend.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider type tag; defaults to the table name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Whether the backend accepts tools on streaming requests.
    /// Unset means "guess from kind and URL".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_with_tools: Option<bool>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("streaming_with_tools", &self.streaming_with_tools)
            .finish()
    }
}

/// A remote tool-protocol server, spawned over stdio or reached over HTTP.
#[derive(Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name; becomes the middle segment of `mcp_<server>_<tool>`
    pub name: String,

    /// "stdio" or "http"
    #[serde(default = "default_mcp_transport")]
    pub transport: String,

    /// For stdio: the command to execute (e.g., "npx", "uvx")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// For http: the server URL (e.g., "http://localhost:8000/mcp")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variables for stdio processes; values may be secrets
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

fn default_mcp_transport() -> String {
    "http".into()
}

impl std::fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_names: Vec<&String> = self.env.keys().collect();
        f.debug_struct("McpServerConfig")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("url", &self.url)
            .field("enabled", &self.enabled)
            .field("env", &env_names)
            .finish()
    }
}

/// A user-authored tool whose body runs in a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON-Schema-like parameter description; repaired before use
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,

    /// Program and leading arguments; the body is fed on stdin
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,

    pub body: String,

    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl AppConfig {
    /// Load configuration from the default path (~/.toolpilot/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `TOOLPILOT_API_KEY` (highest priority)
    /// - `OPENAI_API_KEY`
    /// - `OPENROUTER_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("TOOLPILOT_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("TOOLPILOT_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("TOOLPILOT_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolpilot")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.parameters.temperature) {
            return Err(ConfigError::ValidationError(
                "parameters.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if let Some(top_p) = self.parameters.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ConfigError::ValidationError(
                    "parameters.top_p must be between 0.0 and 1.0".into(),
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.agent.confidence_threshold) {
            return Err(ConfigError::ValidationError(
                "agent.confidence_threshold must be between 0.0 and 1.0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for server in &self.mcp_servers {
            if server.name.is_empty() || server.name.contains('_') {
                return Err(ConfigError::ValidationError(format!(
                    "mcp server name '{}' must be non-empty and contain no underscores",
                    server.name
                )));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate mcp server '{}'",
                    server.name
                )));
            }
            let endpoint_missing = match server.transport.as_str() {
                "stdio" => server.command.is_none(),
                "http" | "streamable-http" => server.url.is_none(),
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "mcp server '{}' has unknown transport '{other}'",
                        server.name
                    )));
                }
            };
            if endpoint_missing {
                return Err(ConfigError::ValidationError(format!(
                    "mcp server '{}' is missing the command or url for its transport",
                    server.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for tool in &self.stored_tools {
            if tool.name.is_empty() {
                return Err(ConfigError::ValidationError("stored tool with empty name".into()));
            }
            if tool.name.starts_with("mcp_") {
                return Err(ConfigError::ValidationError(format!(
                    "stored tool '{}' uses the reserved mcp_ prefix",
                    tool.name
                )));
            }
            if tool.interpreter.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "stored tool '{}' has an empty interpreter",
                    tool.name
                )));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate stored tool '{}'",
                    tool.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// The configured server names whose tools should be offered.
    pub fn enabled_mcp_servers(&self) -> Vec<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| self.mcp_enabled_servers.is_empty() || self.mcp_enabled_servers.contains(&s.name))
            .collect()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            system_prompt: None,
            parameters: ParametersConfig::default(),
            features: FeaturesConfig::default(),
            agent: AgentPolicy::default(),
            providers: BTreeMap::new(),
            mcp_servers: vec![],
            mcp_enabled_servers: vec![],
            stored_tools: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
