//! Per-message execution state of an agent run.
//!
//! One [`AgentExecutionContext`] is created for each user message, owned by
//! the loop for the duration of the run and dropped afterwards. The tool
//! invoker appends to its attempt log; nothing else writes to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Receives user-visible text: streamed model content and progress narration.
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One attempt at executing one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionAttempt {
    /// 1-based attempt number within the call
    pub attempt: u32,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct AgentExecutionContext {
    pub original_query: String,

    /// Append-only, in execution order
    pub attempts: Vec<ToolExecutionAttempt>,

    pub tools_available: Vec<String>,
    pub current_step: u32,
    pub step_budget: u32,

    /// Every narration line, whether or not it was forwarded
    pub progress_log: Vec<String>,

    callback: Option<ProgressCallback>,
    track_progress: bool,
}

impl AgentExecutionContext {
    pub fn new(original_query: impl Into<String>) -> Self {
        Self {
            original_query: original_query.into(),
            attempts: Vec::new(),
            tools_available: Vec::new(),
            current_step: 0,
            step_budget: 1,
            progress_log: Vec::new(),
            callback: None,
            track_progress: true,
        }
    }

    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_progress_tracking(mut self, enabled: bool) -> Self {
        self.track_progress = enabled;
        self
    }

    pub fn record(&mut self, attempt: ToolExecutionAttempt) {
        self.attempts.push(attempt);
    }

    /// Progress narration. Logged always, forwarded only with progress tracking on.
    pub fn narrate(&mut self, text: impl Into<String>) {
        let text = text.into();
        debug!(step = self.current_step, "{}", text.trim());
        if self.track_progress {
            if let Some(callback) = &self.callback {
                callback(&text);
            }
        }
        self.progress_log.push(text);
    }

    /// Model content; always forwarded.
    pub fn stream_text(&self, text: &str) {
        if let Some(callback) = &self.callback {
            callback(text);
        }
    }

    pub fn sink(&self) -> Option<&ProgressCallback> {
        self.callback.as_ref()
    }

    pub fn successful_attempts(&self) -> impl Iterator<Item = &ToolExecutionAttempt> {
        self.attempts.iter().filter(|a| a.success)
    }
}
