//! Run lifecycle events.
//!
//! The agent loop and tool invoker publish these as a run progresses;
//! anything holding a receiver can observe runs without being wired into
//! the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// One model turn finished
    TurnCompleted {
        step: u32,
        model: String,
        streamed: bool,
        tool_calls: usize,
        timestamp: DateTime<Utc>,
    },

    /// One tool call finished, after all of its attempts
    ToolExecuted {
        tool_name: String,
        success: bool,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A run ended, for whatever reason
    AgentFinished {
        model: String,
        steps_consumed: u32,
        tokens_used: u32,
        aborted: bool,
        timestamp: DateTime<Utc>,
    },

    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TurnCompleted { .. } => "turn_completed",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::AgentFinished { .. } => "agent_finished",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::TurnCompleted { timestamp, .. }
            | Self::ToolExecuted { timestamp, .. }
            | Self::AgentFinished { timestamp, .. }
            | Self::ErrorOccurred { timestamp, .. } => *timestamp,
        }
    }
}

/// Fan-out of [`DomainEvent`]s over a `tokio::sync::broadcast` channel.
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded;
/// publishers never wait.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        tracing::trace!(event = event.label(), "Publishing domain event");
        // Err only means nobody is listening
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
