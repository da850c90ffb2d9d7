//! `toolpilot tools`: list the tools the model would be offered.

use toolpilot_agent::ChatService;
use toolpilot_config::AppConfig;
use toolpilot_core::provider::ToolDefinition;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if !config.features.enable_tools {
        println!("Tools are disabled (features.enable_tools = false).");
        return Ok(());
    }

    let service = ChatService::from_config(&config);
    let tools = service.available_tools().await;
    service.shutdown().await;

    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }
    println!("{} tools:", tools.len());
    println!();
    for tool in &tools {
        println!("{}", describe(tool));
    }
    Ok(())
}

fn describe(tool: &ToolDefinition) -> String {
    let params: Vec<String> = tool.parameters["properties"]
        .as_object()
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();
    let mut line = format!("  {:<28} {}", tool.name, tool.description);
    if !params.is_empty() {
        line.push_str(&format!("\n  {:<28} params: {}", "", params.join(", ")));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_parameter_names() {
        let tool = ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather".into(),
            parameters: serde_json::json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        };
        let text = describe(&tool);
        assert!(text.contains("get_weather"));
        assert!(text.contains("params: city"));
    }
}
