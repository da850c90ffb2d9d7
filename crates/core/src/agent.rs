//! Agent policy: the per-invocation behavior settings of the agent loop.
//!
//! A policy is a plain value. Each loop run receives its own copy, so
//! concurrent conversations never share mutable settings.

use serde::{Deserialize, Serialize};

/// Behavior settings for one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPolicy {
    /// Autonomous multi-step mode; `false` selects the single-pass standard mode
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts per tool call, and step failures tolerated per run
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts of the same tool call
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Feed failure hints back to the model so it can fix its own calls
    #[serde(default = "default_true")]
    pub enable_self_correction: bool,

    /// Describe each tool's parameters in the system prompt
    #[serde(default = "default_true")]
    pub enable_tool_guidance: bool,

    /// Emit progress narration through the chunk callback
    #[serde(default = "default_true")]
    pub enable_progress_tracking: bool,

    /// Step budget of the loop
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,

    /// Confidence the model should reach before giving a final answer
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_max_tool_calls() -> u32 {
    10
}
fn default_confidence_threshold() -> f32 {
    0.7
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_self_correction: true,
            enable_tool_guidance: true,
            enable_progress_tracking: true,
            max_tool_calls: default_max_tool_calls(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl AgentPolicy {
    /// Number of loop steps for a run, given whether any tool is available.
    ///
    /// At least one step; at least two with tools, since a tool result can
    /// only be consumed by a later turn.
    pub fn step_budget(&self, tools_available: bool) -> u32 {
        let floor = if tools_available { 2 } else { 1 };
        self.max_tool_calls.max(floor)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let policy = AgentPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay_ms, 1000);
        assert_eq!(policy.max_tool_calls, 10);
        assert!(policy.enable_progress_tracking);
    }

    #[test]
    fn step_budget_floors() {
        let policy = AgentPolicy { max_tool_calls: 0, ..Default::default() };
        assert_eq!(policy.step_budget(false), 1);
        assert_eq!(policy.step_budget(true), 2);

        let policy = AgentPolicy { max_tool_calls: 1, ..Default::default() };
        assert_eq!(policy.step_budget(false), 1);
        assert_eq!(policy.step_budget(true), 2);

        let policy = AgentPolicy { max_tool_calls: 7, ..Default::default() };
        assert_eq!(policy.step_budget(true), 7);
    }

    #[test]
    fn partial_toml_table_fills_defaults() {
        let policy: AgentPolicy = serde_json::from_value(serde_json::json!({
            "max_retries": 5
        }))
        .unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.max_tool_calls, 10);
        assert!(policy.enable_self_correction);
    }
}
