//! Tool invoker: runs one resolved tool call with bounded retry.
//!
//! Never returns an error. Every failure is folded into a [`ToolOutcome`]
//! whose tool message tells the model what went wrong.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use toolpilot_core::error::ToolError;
use toolpilot_core::event::{DomainEvent, EventBus};
use toolpilot_core::message::{Message, MessageToolCall};
use toolpilot_core::{AgentPolicy, Artifact, ProtocolToolCall, ProtocolToolClient, ScriptEvaluator};
use toolpilot_tools::{ToolCatalog, ToolKind, normalize_protocol_result};
use tracing::{debug, info, warn};

use crate::context::{AgentExecutionContext, ToolExecutionAttempt};

const CORRECTION_HINT: &str = "Check the tool's parameters and call it again with corrected arguments, or try a different approach.";

/// Attempts per call and the fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_policy(policy: &AgentPolicy) -> Self {
        Self {
            max_attempts: policy.max_retries.max(1),
            delay: policy.retry_delay(),
        }
    }

    /// One attempt, no retry.
    pub fn single() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Everything the loop needs to know about one executed call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,

    /// Result text on success
    pub output: String,

    /// Structured result, when the tool produced one
    pub data: Option<Value>,

    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub images: Vec<String>,
    pub attempts: u32,

    /// The tool-role message answering this call
    pub message: Message,
}

/// Parse raw argument text. Empty, `null` and `undefined` mean "no arguments".
pub fn parse_arguments(raw: &str) -> Result<Value, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" || raw == "undefined" {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(format!("{e} in `{raw}`")))
}

#[derive(Default)]
struct Executed {
    text: String,
    data: Option<Value>,
    artifacts: Vec<Artifact>,
    images: Vec<String>,
}

#[derive(Clone)]
pub struct ToolInvoker {
    catalog: Arc<ToolCatalog>,
    protocol: Option<Arc<dyn ProtocolToolClient>>,
    evaluator: Arc<dyn ScriptEvaluator>,
    retry: RetryPolicy,
    self_correction: bool,
    events: Option<Arc<EventBus>>,
}

impl ToolInvoker {
    pub fn new(catalog: Arc<ToolCatalog>, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self {
            catalog,
            protocol: None,
            evaluator,
            retry: RetryPolicy::single(),
            self_correction: false,
            events: None,
        }
    }

    pub fn with_protocol_client(mut self, client: Option<Arc<dyn ProtocolToolClient>>) -> Self {
        self.protocol = client;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_self_correction(mut self, enabled: bool) -> Self {
        self.self_correction = enabled;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Execute calls one after another, in the order received.
    pub async fn invoke_all(
        &self,
        calls: &[MessageToolCall],
        ctx: &mut AgentExecutionContext,
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(self.invoke(call, ctx).await);
        }
        outcomes
    }

    /// Execute one call, retrying transient failures.
    ///
    /// Every attempt is appended to `ctx.attempts`. Malformed arguments fail
    /// before any attempt is made; unknown tools fail after exactly one.
    pub async fn invoke(&self, call: &MessageToolCall, ctx: &mut AgentExecutionContext) -> ToolOutcome {
        let started = Instant::now();

        let arguments = match parse_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Rejected tool call arguments");
                return self.finish(call, Err(e.to_string()), 0, started);
            }
        };

        let Some(kind) = self.catalog.kind_of(&call.name) else {
            let error = self.not_found_message(&call.name);
            ctx.record(attempt_entry(1, call, &arguments, Some(error.clone())));
            return self.finish(call, Err(error), 1, started);
        };

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            debug!(tool = %call.name, attempt, "Executing tool");
            match self.execute_once(&kind, call, arguments.clone()).await {
                Ok(executed) => {
                    ctx.record(attempt_entry(attempt, call, &arguments, None));
                    break Ok(executed);
                }
                Err(e) => {
                    let error = match &e {
                        ToolError::NotFound(_) => self.not_found_message(&call.name),
                        other => other.to_string(),
                    };
                    ctx.record(attempt_entry(attempt, call, &arguments, Some(error.clone())));

                    if !e.is_retryable() || attempt >= self.retry.max_attempts {
                        break Err(error);
                    }
                    warn!(tool = %call.name, attempt, error = %e, "Tool attempt failed, retrying");
                    ctx.narrate(format!(
                        "Retry {}/{} for {}\n",
                        attempt + 1,
                        self.retry.max_attempts,
                        call.name
                    ));
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        };

        self.finish(call, result, attempt, started)
    }

    async fn execute_once(
        &self,
        kind: &ToolKind,
        call: &MessageToolCall,
        arguments: Value,
    ) -> Result<Executed, ToolError> {
        match kind {
            ToolKind::RemoteProtocol { server, tool } => {
                let client = self
                    .protocol
                    .as_ref()
                    .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
                let result = client
                    .invoke(ProtocolToolCall {
                        id: call.id.clone(),
                        server: server.clone(),
                        name: tool.clone(),
                        arguments,
                    })
                    .await?;
                if !result.success {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: call.name.clone(),
                        reason: result
                            .error
                            .unwrap_or_else(|| "MCP tool execution failed".to_string()),
                    });
                }
                let normalized = normalize_protocol_result(&call.name, &result);
                Ok(Executed {
                    text: normalized.text,
                    data: normalized.data,
                    artifacts: normalized.artifacts,
                    images: normalized.images,
                })
            }
            ToolKind::Builtin => {
                let result = self.catalog.builtin().execute(&call.name, arguments).await?;
                if !result.success {
                    return Err(ToolError::ExecutionFailed {
                        tool_name: call.name.clone(),
                        reason: result.output,
                    });
                }
                Ok(Executed {
                    text: result.output,
                    data: result.data,
                    ..Default::default()
                })
            }
            ToolKind::StoredScript => {
                let tool = self
                    .catalog
                    .stored(&call.name)
                    .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
                let value = self.evaluator.evaluate(tool.invocation(arguments)).await?;
                Ok(match value {
                    Value::String(text) => Executed {
                        text,
                        ..Default::default()
                    },
                    structured @ (Value::Object(_) | Value::Array(_)) => Executed {
                        text: serde_json::to_string_pretty(&structured)
                            .unwrap_or_else(|_| structured.to_string()),
                        data: Some(structured),
                        ..Default::default()
                    },
                    scalar => Executed {
                        text: scalar.to_string(),
                        ..Default::default()
                    },
                })
            }
        }
    }

    fn not_found_message(&self, name: &str) -> String {
        let names = self.catalog.names();
        let available = if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        };
        format!("Tool '{name}' not found. Available tools: {available}")
    }

    fn finish(
        &self,
        call: &MessageToolCall,
        result: Result<Executed, String>,
        attempts: u32,
        started: Instant,
    ) -> ToolOutcome {
        let duration_ms = started.elapsed().as_millis() as u64;
        let success = result.is_ok();
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                success,
                attempts,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        match result {
            Ok(executed) => {
                info!(tool = %call.name, attempts, duration_ms, "Tool succeeded");
                let message = Message::tool_result(&call.id, &executed.text)
                    .with_name(&call.name)
                    .with_images(executed.images.clone());
                ToolOutcome {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    success: true,
                    output: executed.text,
                    data: executed.data,
                    error: None,
                    artifacts: executed.artifacts,
                    images: executed.images,
                    attempts,
                    message,
                }
            }
            Err(error) => {
                warn!(tool = %call.name, attempts, error = %error, "Tool failed");
                let mut content = format!("Error: {error}");
                if self.self_correction {
                    content.push_str("\n\n");
                    content.push_str(CORRECTION_HINT);
                }
                ToolOutcome {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    success: false,
                    output: String::new(),
                    data: None,
                    error: Some(error),
                    artifacts: Vec::new(),
                    images: Vec::new(),
                    attempts,
                    message: Message::tool_result(&call.id, content).with_name(&call.name),
                }
            }
        }
    }
}

fn attempt_entry(
    attempt: u32,
    call: &MessageToolCall,
    arguments: &Value,
    error: Option<String>,
) -> ToolExecutionAttempt {
    ToolExecutionAttempt {
        attempt,
        tool_name: call.name.clone(),
        arguments: arguments.clone(),
        success: error.is_none(),
        error,
        timestamp: Utc::now(),
    }
}
