//! Shared test helpers: a scripted provider and canned tools.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use toolpilot_core::error::{ProviderError, ToolError};
use toolpilot_core::message::{Message, MessageToolCall};
use toolpilot_core::provider::{
    BackendProfile, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta, Usage,
};
use toolpilot_core::tool::{Tool, ToolResult};
use toolpilot_core::{
    ContentPart, ProtocolToolCall, ProtocolToolClient, ProtocolToolInfo, ProtocolToolResult,
    ServerAvailability,
};

/// One scripted answer, consumed by either `complete` or `stream`.
pub enum Scripted {
    Reply(ProviderResponse),
    Stream(Vec<Result<StreamChunk, ProviderError>>),
    /// Send these chunks, then keep the stream open until the receiver is dropped.
    Hang(Vec<StreamChunk>),
    Fail(ProviderError),
}

/// A provider that plays back a script, one entry per call.
///
/// Panics if more calls are made than entries provided.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ProviderRequest>>,
    profile: BackendProfile,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            profile: BackendProfile::new("ollama", "http://localhost:11434/v1"),
        }
    }

    pub fn replies(responses: Vec<ProviderResponse>) -> Self {
        Self::new(responses.into_iter().map(Scripted::Reply).collect())
    }

    pub fn with_profile(mut self, profile: BackendProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: ProviderRequest) -> Scripted {
        let mut requests = self.requests.lock().unwrap();
        let call = requests.len();
        requests.push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("ScriptedProvider: no more responses (call #{call})"))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn profile(&self) -> BackendProfile {
        self.profile.clone()
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next(request) {
            Scripted::Reply(response) => Ok(response),
            Scripted::Fail(e) => Err(e),
            Scripted::Stream(_) | Scripted::Hang(_) => {
                panic!("ScriptedProvider: stream entry reached by complete()")
            }
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let (tx, rx) = mpsc::channel(32);
        match self.next(request) {
            Scripted::Fail(e) => return Err(e),
            Scripted::Reply(response) => {
                let _ = tx.send(Ok(chunk_from_response(response))).await;
            }
            Scripted::Stream(items) => {
                tokio::spawn(async move {
                    for item in items {
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Scripted::Hang(chunks) => {
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    tx.closed().await;
                });
            }
        }
        Ok(rx)
    }
}

fn chunk_from_response(response: ProviderResponse) -> StreamChunk {
    let content = response.message.content;
    StreamChunk {
        content: (!content.is_empty()).then_some(content),
        tool_calls: response
            .message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, c)| ToolCallDelta {
                index: Some(i as u32),
                id: Some(c.id),
                name: Some(c.name),
                arguments: Some(c.arguments),
            })
            .collect(),
        usage: response.usage,
        finish_reason: response.finish_reason,
    }
}

pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(usage()),
        model: "mock-model".into(),
        finish_reason: Some("stop".into()),
    }
}

/// Create a response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(thought, tool_calls),
        usage: Some(usage()),
        model: "mock-model".into(),
        finish_reason: Some("tool_calls".into()),
    }
}

/// Helper to create a tool call with id `call_<name>`.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall::new(format!("call_{name}"), name, args.to_string())
}

/// A streamed tool-call fragment.
pub fn call_delta(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> StreamChunk {
    StreamChunk {
        tool_calls: vec![ToolCallDelta {
            index: Some(index),
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: Some(arguments.to_string()),
        }],
        ..Default::default()
    }
}

/// A built-in tool that always fails and counts its invocations.
pub struct FlakyTool {
    pub calls: Arc<AtomicU32>,
}

impl FlakyTool {
    pub fn new() -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (Self { calls: calls.clone() }, calls)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Never works"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::ExecutionFailed {
            tool_name: "flaky".into(),
            reason: "upstream unavailable".into(),
        })
    }
}

/// A protocol client with a fixed tool list that answers every call with text.
pub struct StaticProtocolServer {
    pub tools: Vec<ProtocolToolInfo>,
    pub unavailable: Vec<(String, String)>,
}

impl StaticProtocolServer {
    pub fn with_tool(server: &str, name: &str) -> Self {
        Self {
            tools: vec![ProtocolToolInfo {
                server: server.into(),
                name: name.into(),
                description: format!("{name} on {server}"),
                input_schema: serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            }],
            unavailable: Vec::new(),
        }
    }
}

#[async_trait]
impl ProtocolToolClient for StaticProtocolServer {
    async fn list_available_tools(
        &self,
        server_filter: &[String],
    ) -> Result<Vec<ProtocolToolInfo>, ToolError> {
        Ok(self
            .tools
            .iter()
            .filter(|t| server_filter.is_empty() || server_filter.contains(&t.server))
            .cloned()
            .collect())
    }

    async fn invoke(
        &self,
        call: ProtocolToolCall,
    ) -> Result<ProtocolToolResult, ToolError> {
        Ok(ProtocolToolResult {
            success: true,
            content: vec![ContentPart::text(format!("{} ran", call.name))],
            ..Default::default()
        })
    }

    async fn availability(&self, server_filter: &[String]) -> ServerAvailability {
        let tools = self.list_available_tools(server_filter).await.unwrap_or_default();
        let mut available: Vec<String> = tools.iter().map(|t| t.server.clone()).collect();
        available.dedup();
        ServerAvailability {
            available,
            unavailable: self.unavailable.clone(),
            total_tools: tools.len(),
        }
    }
}
