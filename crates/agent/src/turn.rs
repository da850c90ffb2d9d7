//! Turn executor: one request/response cycle with the model.
//!
//! Hides the difference between streamed and single-shot delivery. Either
//! way the caller gets one [`StepResult`] with the full text, the complete
//! tool calls, and usage.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use toolpilot_core::error::ProviderError;
use toolpilot_core::message::MessageToolCall;
use toolpilot_core::provider::{BackendProfile, Provider, ProviderRequest, ToolCallDelta, Usage};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ProgressCallback;

pub const FALLBACK_NOTICE: &str = "Switching to non-streaming mode for tool support...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Streaming,
    NonStreaming,
}

/// Decide how to deliver a turn.
///
/// An explicit capability flag on the profile wins. Otherwise hosted API
/// families get tools without streaming, local backends stream with tools,
/// and unknown backends fall back to single-shot when tools are attached.
pub fn select_transport_mode(
    streaming_enabled: bool,
    tools_present: bool,
    profile: &BackendProfile,
) -> TransportMode {
    if !streaming_enabled {
        return TransportMode::NonStreaming;
    }
    if !tools_present {
        return TransportMode::Streaming;
    }
    match profile.streaming_with_tools {
        Some(true) => TransportMode::Streaming,
        Some(false) => TransportMode::NonStreaming,
        None if profile.is_hosted() => TransportMode::NonStreaming,
        None if profile.is_local() => TransportMode::Streaming,
        None => TransportMode::NonStreaming,
    }
}

/// How a step result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Streamed,
    Single,
    /// Streaming was refused for this tool set and the turn was retried single-shot.
    StreamFallback,
}

/// Outcome of one turn.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub delivery: Delivery,
    pub text: String,
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Error)]
pub enum TurnError {
    /// Cancelled by the caller; carries whatever text had arrived.
    #[error("turn aborted")]
    Aborted { partial_text: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl TurnError {
    fn classify(e: ProviderError, partial_text: String) -> Self {
        if e.is_abort() {
            Self::Aborted { partial_text }
        } else {
            Self::Provider(e)
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    index: Option<u32>,
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles tool calls from streamed fragments.
///
/// Fragments are matched by id, then by index; a fragment carrying only a
/// name opens a new call and anything else extends the latest one. Argument
/// text is concatenated in arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    entries: Vec<PendingCall>,
}

impl ToolCallAccumulator {
    pub fn apply(&mut self, delta: &ToolCallDelta) {
        let slot = self.locate(delta);
        let entry = &mut self.entries[slot];
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            entry.name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            entry.arguments.push_str(arguments);
        }
    }

    fn locate(&mut self, delta: &ToolCallDelta) -> usize {
        if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(i) = self.entries.iter().position(|e| e.id == id) {
                return i;
            }
            return self.open(delta.index, Some(id));
        }
        if let Some(index) = delta.index {
            if let Some(i) = self.entries.iter().rposition(|e| e.index == Some(index)) {
                return i;
            }
            return self.open(Some(index), None);
        }
        if delta.name.is_some() || self.entries.is_empty() {
            return self.open(None, None);
        }
        self.entries.len() - 1
    }

    fn open(&mut self, index: Option<u32>, id: Option<&str>) -> usize {
        self.entries.push(PendingCall {
            index,
            id: id.map(String::from).unwrap_or_else(synthesize_call_id),
            name: String::new(),
            arguments: String::new(),
        });
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Completed calls in arrival order, minus the unusable ones.
    pub fn finish(self) -> Vec<MessageToolCall> {
        retain_valid(
            self.entries
                .into_iter()
                .map(|e| MessageToolCall::new(e.id, e.name, e.arguments))
                .collect(),
        )
    }
}

fn synthesize_call_id() -> String {
    format!("tool_{}", Uuid::new_v4().simple())
}

/// Drop calls without a name or with unparseable arguments, and give every
/// survivor an id. Empty argument text counts as `{}`.
fn retain_valid(calls: Vec<MessageToolCall>) -> Vec<MessageToolCall> {
    calls
        .into_iter()
        .filter_map(|mut call| {
            if call.name.trim().is_empty() {
                warn!(call_id = %call.id, "Discarding tool call without a name");
                return None;
            }
            if call.arguments.trim().is_empty() {
                call.arguments = "{}".into();
            }
            if let Err(e) = serde_json::from_str::<serde_json::Value>(&call.arguments) {
                warn!(tool = %call.name, error = %e, "Discarding tool call with malformed arguments");
                return None;
            }
            if call.id.is_empty() {
                call.id = synthesize_call_id();
            }
            Some(call)
        })
        .collect()
}

/// Runs single turns against one provider.
pub struct TurnExecutor {
    provider: Arc<dyn Provider>,
    streaming_enabled: bool,
}

impl TurnExecutor {
    pub fn new(provider: Arc<dyn Provider>, streaming_enabled: bool) -> Self {
        Self {
            provider,
            streaming_enabled,
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn mode_for(&self, request: &ProviderRequest) -> TransportMode {
        select_transport_mode(
            self.streaming_enabled,
            !request.tools.is_empty(),
            &self.provider.profile(),
        )
    }

    /// Perform one turn.
    ///
    /// Streamed text is forwarded to `sink` as it arrives; single-shot text
    /// only comes back in the [`StepResult`], for the caller to forward. Cancelling
    /// `cancel` ends the turn with [`TurnError::Aborted`] holding the text
    /// received so far.
    pub async fn execute(
        &self,
        request: ProviderRequest,
        sink: Option<&ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, TurnError> {
        if cancel.is_cancelled() {
            return Err(TurnError::Aborted {
                partial_text: String::new(),
            });
        }

        match self.mode_for(&request) {
            TransportMode::NonStreaming => self.single(request, Delivery::Single, cancel).await,
            TransportMode::Streaming => {
                let tools_present = !request.tools.is_empty();
                match self.streamed(request.clone(), sink, cancel).await {
                    Err(TurnError::Provider(e))
                        if tools_present && e.is_streaming_tools_incompatibility() =>
                    {
                        warn!(
                            provider = %self.provider.name(),
                            error = %e,
                            "Streaming rejected with tools, retrying without streaming"
                        );
                        if let Some(sink) = sink {
                            sink(FALLBACK_NOTICE);
                        }
                        self.single(request, Delivery::StreamFallback, cancel).await
                    }
                    other => other,
                }
            }
        }
    }

    /// Perform one turn without streaming, whatever the backend supports.
    pub async fn execute_single(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<StepResult, TurnError> {
        self.single(request, Delivery::Single, cancel).await
    }

    async fn single(
        &self,
        mut request: ProviderRequest,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<StepResult, TurnError> {
        request.stream = false;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TurnError::Aborted { partial_text: String::new() });
            }
            response = self.provider.complete(request) => {
                response.map_err(|e| TurnError::classify(e, String::new()))?
            }
        };

        debug!(
            model = %response.model,
            tool_calls = response.message.tool_calls.len(),
            "Turn completed"
        );
        Ok(StepResult {
            delivery,
            text: response.message.content,
            tool_calls: retain_valid(response.message.tool_calls),
            usage: response.usage,
        })
    }

    async fn streamed(
        &self,
        mut request: ProviderRequest,
        sink: Option<&ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, TurnError> {
        request.stream = true;
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TurnError::Aborted { partial_text: String::new() });
            }
            rx = self.provider.stream(request) => {
                rx.map_err(|e| TurnError::classify(e, String::new()))?
            }
        };

        let mut text = String::new();
        let mut calls = ToolCallAccumulator::default();
        let mut usage = None;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(received = text.len(), "Stream aborted");
                    return Err(TurnError::Aborted { partial_text: text });
                }
                item = rx.recv() => item,
            };

            match item {
                None => break,
                Some(Ok(chunk)) => {
                    if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                        if let Some(sink) = sink {
                            sink(&content);
                        }
                        text.push_str(&content);
                    }
                    for delta in &chunk.tool_calls {
                        calls.apply(delta);
                    }
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                }
                Some(Err(e)) => return Err(TurnError::classify(e, text)),
            }
        }

        Ok(StepResult {
            delivery: Delivery::Streamed,
            text,
            tool_calls: calls.finish(),
            usage,
        })
    }
}
