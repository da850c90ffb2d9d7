//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, llama.cpp, vLLM, LM Studio, and
//! any endpoint exposing `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - Image attachments as `image_url` content parts
//!
//! Streaming forwards every tool-call fragment as it arrives; reassembly is
//! the caller's job. Dropping the receiver aborts the HTTP request.

use async_trait::async_trait;
use futures::StreamExt;
use toolpilot_core::error::ProviderError;
use toolpilot_core::message::{Message, MessageToolCall, Role};
use toolpilot_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// An OpenAI-compatible chat completions provider.
pub struct OpenAiCompatProvider {
    name: String,
    kind: String,
    base_url: String,
    api_key: String,
    streaming_with_tools: Option<bool>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider. The type tag defaults to `name`.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let name = name.into();
        Self {
            kind: name.clone(),
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            streaming_with_tools: None,
            client,
        }
    }

    /// Override the provider type tag.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Declare whether the backend accepts tools on streaming requests.
    pub fn with_streaming_with_tools(mut self, supported: Option<bool>) -> Self {
        self.streaming_with_tools = supported;
        self
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.to_string(),
                content: Some(Self::to_api_content(m)),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
                name: m.name.clone().filter(|_| m.role == Role::Tool),
            })
            .collect()
    }

    /// Plain string content, or a part list when the message carries images.
    fn to_api_content(message: &Message) -> serde_json::Value {
        if message.images.is_empty() {
            return serde_json::Value::String(message.content.clone());
        }

        let mut parts = vec![serde_json::json!({ "type": "text", "text": message.content })];
        for image in &message.images {
            let url = if image.starts_with("data:") || image.starts_with("http") {
                image.clone()
            } else {
                format!("data:image/jpeg;base64,{image}")
            };
            parts.push(serde_json::json!({ "type": "image_url", "image_url": { "url": url } }));
        }
        serde_json::Value::Array(parts)
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }

        body
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(response);
        }

        let error_body = response.text().await.unwrap_or_default();
        warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
        Err(classify_api_error(status, &error_body))
    }
}

/// Map an HTTP error status and body onto the provider error taxonomy.
pub fn classify_api_error(status: u16, body: &str) -> ProviderError {
    let lower = body.to_lowercase();
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        404 if lower.contains("model") => ProviderError::ModelNotFound(body.to_string()),
        _ if lower.contains("tool_call_id") && lower.contains("duplicate") => {
            ProviderError::DuplicateToolCallId(body.to_string())
        }
        _ if lower.contains("stream") && lower.contains("tool") => {
            ProviderError::StreamingToolsUnsupported(body.to_string())
        }
        _ => ProviderError::ApiError {
            status_code: status,
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl toolpilot_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> BackendProfile {
        BackendProfile {
            kind: self.kind.clone(),
            base_url: self.base_url.clone(),
            streaming_with_tools: self.streaming_with_tools,
        }
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(
            provider = %self.name,
            model = %request.model,
            tools = request.tools.len(),
            "Sending completion request"
        );

        let response = self.post(&body, false).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                })?;

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let content = match choice.message.content {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let message = Message::assistant_with_tool_calls(content, tool_calls);
        let usage = api_response.usage.map(Usage::from);

        Ok(ProviderResponse {
            message,
            usage,
            model: api_response.model.unwrap_or(request.model),
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let body = Self::request_body(&request, true);

        debug!(
            provider = %self.name,
            model = %request.model,
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let response = self.post(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Read the SSE byte stream and forward each event as a chunk
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider = %provider_name, "Stream receiver dropped, aborting request");
                        return;
                    }
                    next = byte_stream.next() => next,
                };

                let bytes = match next {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                    None => return,
                };

                for data in lines.push(&String::from_utf8_lossy(&bytes)) {
                    if data == "[DONE]" {
                        return;
                    }

                    let event = match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(event) => event,
                        Err(e) => {
                            trace!(
                                provider = %provider_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                            continue;
                        }
                    };

                    if let Some(err) = event.error {
                        let _ = tx.send(Err(classify_api_error(400, &err.to_string()))).await;
                        return;
                    }

                    if let Some(chunk) = event.into_chunk() {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Splits an SSE byte stream into `data:` payloads across chunk boundaries.
#[derive(Default)]
struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut payloads = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim().to_string());
            }
        }

        payloads
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    // Some local servers omit ids; the turn executor synthesizes them
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta: arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl StreamResponse {
    /// The chunk to forward, or `None` when the event carries nothing.
    fn into_chunk(self) -> Option<StreamChunk> {
        let mut chunk = StreamChunk {
            usage: self.usage.map(Usage::from),
            ..Default::default()
        };

        if let Some(choice) = self.choices.into_iter().next() {
            chunk.content = choice.delta.content.filter(|c| !c.is_empty());
            chunk.finish_reason = choice.finish_reason;
            chunk.tool_calls = choice
                .delta
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| {
                    let (name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    ToolCallDelta {
                        index: tc.index,
                        id: tc.id.filter(|id| !id.is_empty()),
                        name: name.filter(|n| !n.is_empty()),
                        arguments,
                    }
                })
                .collect();
        }

        let empty = chunk.content.is_none()
            && chunk.tool_calls.is_empty()
            && chunk.usage.is_none()
            && chunk.finish_reason.is_none();
        (!empty).then_some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolpilot_core::Provider;

    #[test]
    fn openai_constructor() {
        let provider = OpenAiCompatProvider::openai("sk-test");
        assert_eq!(provider.name(), "openai");
        assert!(provider.base_url.contains("api.openai.com"));
        assert!(provider.profile().is_hosted());
    }

    #[test]
    fn ollama_constructor() {
        let provider = OpenAiCompatProvider::ollama(None);
        assert_eq!(provider.name(), "ollama");
        assert!(provider.base_url.contains("localhost:11434"));
        assert!(provider.profile().is_local());
    }

    #[test]
    fn profile_carries_kind_and_capability() {
        let provider = OpenAiCompatProvider::new("lan", "http://10.0.0.5:8080/v1/", "")
            .with_kind("llamacpp")
            .with_streaming_with_tools(Some(true));
        let profile = provider.profile();
        assert_eq!(profile.kind, "llamacpp");
        assert_eq!(profile.base_url, "http://10.0.0.5:8080/v1");
        assert_eq!(profile.streaming_with_tools, Some(true));
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
        assert_eq!(api_messages[1].content, Some(serde_json::json!("Hello")));
    }

    #[test]
    fn message_conversion_with_images() {
        let msg = Message::user("What is this?")
            .with_images(vec!["iVBORw0KGgo=".into(), "data:image/png;base64,AAAA".into()]);
        let api_msgs = OpenAiCompatProvider::to_api_messages(&[msg]);
        let parts = api_msgs[0].content.as_ref().unwrap().as_array().unwrap().clone();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,iVBORw0KGgo=");
        assert_eq!(parts[2]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Look up current weather".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let api_tools = OpenAiCompatProvider::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].function.name, "get_weather");
        assert_eq!(api_tools[0].r#type, "function");
    }

    #[test]
    fn request_body_includes_sampling_and_tools() {
        let mut request = ProviderRequest::new("gpt-4o", vec![Message::user("hi")]);
        request.top_p = Some(0.9);
        request.max_tokens = Some(256);
        request.tools = vec![ToolDefinition {
            name: "get_weather".into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object"}),
        }];

        let body = OpenAiCompatProvider::request_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 256);
        assert!(body["top_p"].as_f64().unwrap() > 0.89);
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");

        let body = OpenAiCompatProvider::request_body(&ProviderRequest::new("m", vec![]), false);
        assert!(body.get("tools").is_none());
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn error_classification() {
        assert!(matches!(classify_api_error(429, ""), ProviderError::RateLimited { .. }));
        assert!(matches!(classify_api_error(401, ""), ProviderError::AuthenticationFailed(_)));
        assert!(matches!(
            classify_api_error(404, "model 'nope' not found"),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(
            classify_api_error(400, "Tools are not supported in streaming mode"),
            ProviderError::StreamingToolsUnsupported(_)
        ));
        assert!(matches!(
            classify_api_error(400, "Duplicate value for 'tool_call_id' of call_1"),
            ProviderError::DuplicateToolCallId(_)
        ));
        assert!(matches!(
            classify_api_error(500, "internal"),
            ProviderError::ApiError { status_code: 500, .. }
        ));
    }

    // --- SSE parsing tests ---

    #[test]
    fn sse_lines_split_across_chunks() {
        let mut lines = SseLineBuffer::default();
        assert!(lines.push("data: {\"a\"").is_empty());
        let payloads = lines.push(":1}\r\n\n: keep-alive\ndata:[DONE]\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn parse_stream_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        let chunk = parsed.into_chunk().unwrap();
        assert_eq!(chunk.content.as_deref(), Some("Hello"));
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn parse_stream_finish_chunk() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        let chunk = parsed.into_chunk().unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
        assert!(chunk.content.is_none());
    }

    #[test]
    fn empty_delta_produces_no_chunk() {
        let data = r#"{"choices":[{"delta":{"content":""},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        assert!(parsed.into_chunk().is_none());
    }

    #[test]
    fn parse_stream_tool_call_deltas() {
        let first = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"get_weather","arguments":""}}]},"finish_reason":null}]}"#;
        let chunk = serde_json::from_str::<StreamResponse>(first).unwrap().into_chunk().unwrap();
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].index, Some(0));
        assert_eq!(chunk.tool_calls[0].id.as_deref(), Some("call_abc"));
        assert_eq!(chunk.tool_calls[0].name.as_deref(), Some("get_weather"));

        // Arguments arrive incrementally as fragments, without id or name
        let second = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\""}}]},"finish_reason":null}]}"#;
        let chunk = serde_json::from_str::<StreamResponse>(second).unwrap().into_chunk().unwrap();
        assert!(chunk.tool_calls[0].id.is_none());
        assert!(chunk.tool_calls[0].name.is_none());
        assert_eq!(chunk.tool_calls[0].arguments.as_deref(), Some("{\"city\""));
    }

    #[test]
    fn parse_stream_usage() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let chunk = serde_json::from_str::<StreamResponse>(data).unwrap().into_chunk().unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn parse_stream_error_event() {
        let data = r#"{"error":{"message":"tools are not supported with stream=true"}}"#;
        let parsed: StreamResponse = serde_json::from_str(data).unwrap();
        let err = classify_api_error(400, &parsed.error.unwrap().to_string());
        assert!(err.is_streaming_tools_incompatibility());
    }

    #[test]
    fn parse_completion_without_tool_call_ids() {
        let data = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        let tc = &parsed.choices[0].message.tool_calls.as_ref().unwrap()[0];
        assert!(tc.id.is_empty());
        assert_eq!(tc.function.name, "get_weather");
        assert!(parsed.model.is_none());
    }

    #[test]
    fn message_conversion_tool_response() {
        let msg = Message::tool_result("call_1", "result data").with_name("get_weather");
        let api_msgs = OpenAiCompatProvider::to_api_messages(&[msg]);
        assert_eq!(api_msgs[0].role, "tool");
        assert_eq!(api_msgs[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(api_msgs[0].name.as_deref(), Some("get_weather"));
    }

    #[test]
    fn message_conversion_with_tool_calls() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![MessageToolCall::new("call_1", "get_weather", r#"{"city":"Paris"}"#)],
        );
        let api_msgs = OpenAiCompatProvider::to_api_messages(&[msg]);
        let tc = api_msgs[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc.len(), 1);
        assert_eq!(tc[0].function.name, "get_weather");
    }
}
