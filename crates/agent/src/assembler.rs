//! Result assembler: turns a finished run into the reply envelope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use toolpilot_core::Artifact;
use toolpilot_core::message::Role;
use uuid::Uuid;

use crate::invoker::ToolOutcome;
use crate::loop_runner::LoopOutcome;

pub const APOLOGY: &str =
    "I apologize, but I encountered an error while processing your request. Please try again.";

const EMPTY_RESULT: &str = "I completed the autonomous agent execution, but encountered some technical issues generating the final response. Please check the tool results above.";

pub const FAILURE_LEAD: &str =
    "I gathered some information but ran into problems completing the full analysis.";
pub const BUDGET_LEAD: &str = "I reached the maximum number of steps before finishing.";
pub const DUPLICATE_LEAD: &str =
    "I ran into a conversation-state problem while processing the tool results.";

const EXCERPT_CHARS: usize = 500;

/// The final assistant message handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantReply {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: ReplyMetadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMetadata {
    pub model: String,
    pub tokens: u32,
    pub temperature: f32,
    pub tools_used: Vec<String>,
    pub steps_consumed: u32,
    pub autonomous_mode: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_tool_call_ids: Vec<String>,
    pub tool_results_summary: ResultsSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultsSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Facts about the request that the run itself does not know.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    /// Model as shown to the user, provider prefix included
    pub model: String,
    pub temperature: f32,
    pub autonomous: bool,
}

impl AssistantReply {
    fn new(content: String, metadata: ReplyMetadata, artifacts: Vec<Artifact>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content,
            timestamp: Utc::now(),
            metadata,
            artifacts,
        }
    }

    /// A run cancelled by the caller, keeping what had streamed so far.
    pub fn aborted(partial_text: impl Into<String>, ctx: &ReplyContext) -> Self {
        Self::new(
            partial_text.into(),
            ReplyMetadata {
                aborted: true,
                ..base_metadata(ctx)
            },
            Vec::new(),
        )
    }

    /// An apology for a failure that escaped the run.
    pub fn error(error: impl Into<String>, ctx: &ReplyContext) -> Self {
        Self::new(
            APOLOGY.to_string(),
            ReplyMetadata {
                error: Some(error.into()),
                ..base_metadata(ctx)
            },
            Vec::new(),
        )
    }

    pub fn is_aborted(&self) -> bool {
        self.metadata.aborted
    }
}

fn base_metadata(ctx: &ReplyContext) -> ReplyMetadata {
    ReplyMetadata {
        model: ctx.model.clone(),
        temperature: ctx.temperature,
        autonomous_mode: ctx.autonomous,
        ..Default::default()
    }
}

/// One artifact per structured tool result, plus every artifact a protocol
/// server reported.
pub fn collect_artifacts(outcomes: &[ToolOutcome]) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    for outcome in outcomes.iter().filter(|o| o.success) {
        if !outcome.artifacts.is_empty() {
            artifacts.extend(outcome.artifacts.iter().cloned());
        } else if let Some(data) = &outcome.data {
            let content = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
            artifacts.push(
                Artifact::new("json", format!("{} Result", outcome.tool_name), content)
                    .with_metadata("toolName", serde_json::json!(outcome.tool_name))
                    .with_metadata("toolCallId", serde_json::json!(outcome.call_id)),
            );
        }
    }
    artifacts
}

/// Distinct tool names in first-use order.
pub fn tools_used(outcomes: &[ToolOutcome]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for outcome in outcomes {
        if !names.contains(&outcome.tool_name) {
            names.push(outcome.tool_name.clone());
        }
    }
    names
}

pub fn summarize_results(outcomes: &[ToolOutcome]) -> ResultsSummary {
    let successful = outcomes.iter().filter(|o| o.success).count();
    ResultsSummary {
        total: outcomes.len(),
        successful,
        failed: outcomes.len() - successful,
    }
}

/// A fallback answer built from whatever tool calls succeeded.
pub fn best_effort_summary(outcomes: &[ToolOutcome], lead: &str) -> String {
    let successes: Vec<&ToolOutcome> = outcomes.iter().filter(|o| o.success).collect();
    if successes.is_empty() {
        return format!(
            "{lead} None of the tools produced a usable result, so I could not complete the request. Please try again or rephrase it."
        );
    }

    let mut text = format!("{lead} Here is what I found:\n");
    for outcome in successes {
        text.push_str(&format!(
            "\n**{}**: {}\n",
            outcome.tool_name,
            excerpt(&outcome.output, EXCERPT_CHARS)
        ));
    }
    text.trim_end().to_string()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Wrap a finished run into the reply envelope.
pub fn build_final_message(outcome: LoopOutcome, ctx: &ReplyContext) -> AssistantReply {
    let mut metadata = ReplyMetadata {
        tokens: outcome.usage.total_tokens,
        tools_used: tools_used(&outcome.tool_outcomes),
        steps_consumed: outcome.steps_consumed,
        aborted: outcome.aborted,
        error: outcome.error.clone(),
        processed_tool_call_ids: outcome.processed_ids.clone(),
        tool_results_summary: summarize_results(&outcome.tool_outcomes),
        ..base_metadata(ctx)
    };

    let content = if !outcome.text.trim().is_empty() || outcome.aborted {
        outcome.text
    } else if outcome.error.is_some() {
        APOLOGY.to_string()
    } else {
        EMPTY_RESULT.to_string()
    };
    if outcome.aborted {
        metadata.error = None;
    }

    let artifacts = collect_artifacts(&outcome.tool_outcomes);
    AssistantReply::new(content, metadata, artifacts)
}
