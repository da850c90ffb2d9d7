//! System prompts for standard and autonomous mode.

use toolpilot_core::AgentPolicy;
use toolpilot_core::provider::ToolDefinition;

pub const DEFAULT_PERSONA: &str = "You are a helpful AI assistant.";

/// The configured prompt, or the default persona.
pub fn standard_prompt(base: Option<&str>) -> String {
    base.map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_PERSONA)
        .to_string()
}

/// Prompt for autonomous mode: persona, working principles, and a
/// description of every tool.
pub fn build_enhanced_prompt(base: Option<&str>, tools: &[ToolDefinition], policy: &AgentPolicy) -> String {
    let mut prompt = standard_prompt(base);

    prompt.push_str("\n\n## Working autonomously\n");
    prompt.push_str("- Break the request into steps and work through them one at a time.\n");
    prompt.push_str("- Use tools whenever they give you information you do not already have.\n");
    prompt.push_str("- Read every tool result before deciding what to do next.\n");
    prompt.push_str(&format!(
        "- A failing tool call is retried up to {} times; if it keeps failing, change the arguments or the approach.\n",
        policy.max_retries.max(1)
    ));
    prompt.push_str(&format!(
        "- Give your final answer once you are at least {:.0}% confident in it, without calling further tools.\n",
        policy.confidence_threshold * 100.0
    ));

    if tools.is_empty() {
        return prompt;
    }

    prompt.push_str("\n## Available tools\n");
    for tool in tools {
        prompt.push_str(&format!("- **{}**: {}\n", tool.name, tool.description));
        if policy.enable_tool_guidance {
            let (required, optional) = parameter_names(&tool.parameters);
            if !required.is_empty() {
                prompt.push_str(&format!("  Required: {}\n", required.join(", ")));
            }
            if !optional.is_empty() {
                prompt.push_str(&format!("  Optional: {}\n", optional.join(", ")));
            }
        }
    }
    prompt
}

fn parameter_names(schema: &serde_json::Value) -> (Vec<String>, Vec<String>) {
    let required: Vec<String> = schema["required"]
        .as_array()
        .map(|r| r.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let optional = schema["properties"]
        .as_object()
        .map(|props| {
            props
                .keys()
                .filter(|k| !required.contains(k))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    (required, optional)
}
