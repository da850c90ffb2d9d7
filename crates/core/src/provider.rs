//! Provider trait: the abstraction over model transport clients.
//!
//! A Provider knows how to send a conversation to a model and get a response
//! back, either as a complete message or as a stream of incremental deltas.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o", "qwen3:30b")
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderRequest {
    /// A request with default sampling for `model` over `messages`.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            top_p: None,
            tools: Vec::new(),
            stream: false,
            stop: Vec::new(),
        }
    }
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message
    pub message: Message,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Why generation stopped ("stop", "tool_calls", "length", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Field-wise sum, for totals across several turns.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A fragment of one tool call inside a streaming response.
///
/// Backends send the id and name once and the argument text in pieces;
/// `index` identifies the call when the id is omitted from later fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Newly arrived argument text, to be appended to what came before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Partial tool call deltas
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Set on the last chunk of a choice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    /// A chunk carrying only text.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// What the transport layer knows about the backend behind a provider.
///
/// Used to decide whether tools may be combined with streaming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Provider type tag ("openai", "openrouter", "ollama", "custom", ...)
    pub kind: String,

    /// Base URL of the API
    pub base_url: String,

    /// Explicit capability flag; overrides every heuristic when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_with_tools: Option<bool>,
}

const HOSTED_KINDS: &[&str] = &["openai", "openrouter"];
const HOSTED_URL_MARKERS: &[&str] = &[
    "openai.com",
    "openrouter.ai",
    "api.anthropic.com",
    "generativelanguage.googleapis.com",
];
const LOCAL_KINDS: &[&str] = &["ollama"];
const LOCAL_URL_MARKERS: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0"];

impl BackendProfile {
    pub fn new(kind: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            base_url: base_url.into(),
            streaming_with_tools: None,
        }
    }

    pub fn with_streaming_with_tools(mut self, supported: bool) -> Self {
        self.streaming_with_tools = Some(supported);
        self
    }

    /// A known hosted API family, matched by type tag or base URL.
    pub fn is_hosted(&self) -> bool {
        let kind = self.kind.to_lowercase();
        let url = self.base_url.to_lowercase();
        HOSTED_KINDS.contains(&kind.as_str()) || HOSTED_URL_MARKERS.iter().any(|m| url.contains(m))
    }

    /// A local or self-hosted backend (loopback address or local type tag).
    pub fn is_local(&self) -> bool {
        let kind = self.kind.to_lowercase();
        let url = self.base_url.to_lowercase();
        LOCAL_KINDS.contains(&kind.as_str()) || LOCAL_URL_MARKERS.iter().any(|m| url.contains(m))
    }
}

/// The core Provider trait.
///
/// The agent loop calls `complete()` or `stream()` without knowing which
/// backend is being used.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "ollama").
    fn name(&self) -> &str;

    /// The backend this provider talks to.
    fn profile(&self) -> BackendProfile {
        BackendProfile::new(self.name(), "")
    }

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Dropping the receiver cancels the request. The default implementation
    /// calls `complete()` and replays the result as a single chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let content = response.message.content;
        let _ = tx.send(Ok(StreamChunk {
            content: (!content.is_empty()).then_some(content),
            tool_calls: deltas_from_calls(response.message.tool_calls),
            usage: response.usage,
            finish_reason: response.finish_reason,
        })).await;
        Ok(rx)
    }
}

fn deltas_from_calls(calls: Vec<MessageToolCall>) -> Vec<ToolCallDelta> {
    calls
        .into_iter()
        .enumerate()
        .map(|(i, call)| ToolCallDelta {
            index: Some(i as u32),
            id: Some(call.id),
            name: Some(call.name),
            arguments: Some(call.arguments),
        })
        .collect()
}
