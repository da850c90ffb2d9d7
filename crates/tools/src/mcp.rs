//! Remote-protocol (MCP) tool naming and result normalization.
//!
//! Protocol tools are exposed to the model as `mcp_<server>_<tool>`. Server
//! names never contain `_`, so the first underscore after the prefix splits
//! the name unambiguously.

use serde_json::{Value, json};
use toolpilot_core::{Artifact, ContentPart, ProtocolToolResult};

pub const MCP_PREFIX: &str = "mcp_";

/// Name under which a protocol tool is offered to the model.
pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("{MCP_PREFIX}{server}_{tool}")
}

pub fn is_mcp_tool_name(name: &str) -> bool {
    name.starts_with(MCP_PREFIX)
}

/// Split `mcp_<server>_<tool>` into `(server, tool)`.
pub fn parse_mcp_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_PREFIX)?;
    let (server, tool) = rest.split_once('_')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// A protocol result flattened for the conversation.
#[derive(Debug, Clone, Default)]
pub struct NormalizedOutput {
    /// Content of the tool-role message
    pub text: String,

    /// Data URIs to attach to the tool-role message
    pub images: Vec<String>,

    pub artifacts: Vec<Artifact>,

    /// Structured view of non-text parts, when there were any
    pub data: Option<Value>,
}

/// Flatten multi-part protocol content into text, images and artifacts.
///
/// Text parts are joined by blank lines. Images become data URIs plus a
/// one-line placeholder. Resources and unknown parts with a payload become
/// artifacts and a JSON dump, so nothing a server returns is silently lost.
pub fn normalize_protocol_result(tool_name: &str, result: &ProtocolToolResult) -> NormalizedOutput {
    let mut out = NormalizedOutput::default();
    let mut sections: Vec<String> = Vec::new();
    let mut structured = serde_json::Map::new();

    if result.success {
        for (index, part) in result.content.iter().enumerate() {
            normalize_part(tool_name, index, part, &mut out, &mut sections, &mut structured);
        }
    }

    out.text = if sections.is_empty() {
        if result.success {
            "MCP tool executed successfully".to_string()
        } else {
            result
                .error
                .clone()
                .unwrap_or_else(|| "MCP tool execution failed".to_string())
        }
    } else {
        sections.join("\n\n")
    };

    if !structured.is_empty() {
        out.data = Some(Value::Object(structured));
    }
    out
}

fn normalize_part(
    tool_name: &str,
    index: usize,
    part: &ContentPart,
    out: &mut NormalizedOutput,
    sections: &mut Vec<String>,
    structured: &mut serde_json::Map<String, Value>,
) {
    let artifact = |label: &str, content: String, kind: &str| {
        Artifact::new("json", format!("{tool_name} - {label} Result"), content)
            .with_metadata("toolName", json!(tool_name))
            .with_metadata("source", json!("mcp"))
            .with_metadata("contentIndex", json!(index))
            .with_metadata("originalType", json!(kind))
    };

    match part.kind.as_str() {
        "text" => {
            if let Some(text) = part.text.as_deref().filter(|t| !t.is_empty()) {
                sections.push(text.to_string());
            }
        }
        "image" => {
            let (Some(data), Some(mime)) = (part.data.as_deref(), part.mime_type.as_deref()) else {
                return;
            };
            let uri = if data.starts_with("data:") {
                data.to_string()
            } else {
                format!("data:{mime};base64,{data}")
            };
            let payload = json!({
                "type": "image",
                "mimeType": mime,
                "data": uri,
                "description": format!("Image generated by {tool_name}"),
            });
            out.artifacts.push(
                artifact("Image", pretty(&payload), "image").with_metadata("mimeType", json!(mime)),
            );
            push_image(structured, json!({ "mimeType": mime, "url": uri }));
            out.images.push(uri);
            sections.push(format!("Image generated ({mime})"));
        }
        "resource" => {
            let Some(resource) = &part.resource else { return };
            let dump = pretty(resource);
            out.artifacts.push(artifact("Resource", dump.clone(), "resource"));
            structured.insert("resource".into(), resource.clone());
            sections.push(format!("Resource: {dump}"));
        }
        other => {
            if let Some(data) = &part.data {
                let parsed = serde_json::from_str::<Value>(data).unwrap_or_else(|_| json!(data));
                let dump = pretty(&parsed);
                out.artifacts.push(artifact(other, dump.clone(), other));
                structured.insert("data".into(), parsed);
                sections.push(format!("{other}: {dump}"));
            } else if let Some(text) = &part.text {
                structured.insert(format!("{other}_{index}"), json!(part));
                sections.push(format!("{other}: {text}"));
            }
        }
    }
}

fn push_image(structured: &mut serde_json::Map<String, Value>, image: Value) {
    match structured.get_mut("images") {
        Some(Value::Array(items)) => items.push(image),
        _ => {
            structured.insert("images".into(), json!([image]));
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(content: Vec<ContentPart>) -> ProtocolToolResult {
        ProtocolToolResult {
            success: true,
            content,
            ..Default::default()
        }
    }

    #[test]
    fn naming_round_trip() {
        let name = mcp_tool_name("files", "read_file");
        assert_eq!(name, "mcp_files_read_file");
        assert!(is_mcp_tool_name(&name));
        assert_eq!(parse_mcp_tool_name(&name), Some(("files", "read_file")));
    }

    #[test]
    fn malformed_names_do_not_parse() {
        assert_eq!(parse_mcp_tool_name("get_weather"), None);
        assert_eq!(parse_mcp_tool_name("mcp_files"), None);
        assert_eq!(parse_mcp_tool_name("mcp__read"), None);
        assert_eq!(parse_mcp_tool_name("mcp_files_"), None);
    }

    #[test]
    fn text_parts_join_with_blank_lines() {
        let out = normalize_protocol_result(
            "mcp_files_read",
            &ok(vec![ContentPart::text("first"), ContentPart::text("second")]),
        );
        assert_eq!(out.text, "first\n\nsecond");
        assert!(out.images.is_empty());
        assert!(out.artifacts.is_empty());
        assert!(out.data.is_none());
    }

    #[test]
    fn images_become_data_uris_and_placeholders() {
        let out = normalize_protocol_result(
            "mcp_shots_capture",
            &ok(vec![
                ContentPart::text("Captured"),
                ContentPart::image("iVBORw0KGgo=", "image/png"),
            ]),
        );
        assert_eq!(out.images, vec!["data:image/png;base64,iVBORw0KGgo=".to_string()]);
        assert_eq!(out.text, "Captured\n\nImage generated (image/png)");
        assert_eq!(out.artifacts.len(), 1);
        assert_eq!(out.artifacts[0].metadata["originalType"], "image");
        assert_eq!(out.data.unwrap()["images"][0]["mimeType"], "image/png");
    }

    #[test]
    fn existing_data_uri_is_kept() {
        let out = normalize_protocol_result(
            "t",
            &ok(vec![ContentPart::image("data:image/gif;base64,R0lG", "image/gif")]),
        );
        assert_eq!(out.images[0], "data:image/gif;base64,R0lG");
    }

    #[test]
    fn resources_and_unknown_parts_are_dumped() {
        let out = normalize_protocol_result(
            "t",
            &ok(vec![
                ContentPart {
                    kind: "resource".into(),
                    resource: Some(json!({"uri": "file:///a.txt", "text": "hi"})),
                    ..Default::default()
                },
                ContentPart {
                    kind: "chart".into(),
                    data: Some(r#"{"bars": [1, 2]}"#.into()),
                    ..Default::default()
                },
            ]),
        );
        assert_eq!(out.artifacts.len(), 2);
        assert!(out.text.contains("Resource: "));
        assert!(out.text.contains("file:///a.txt"));
        assert!(out.text.contains("chart: "));
        let data = out.data.unwrap();
        assert_eq!(data["data"]["bars"][1], 2);
    }

    #[test]
    fn empty_or_failed_results_fall_back() {
        let out = normalize_protocol_result("t", &ok(vec![]));
        assert_eq!(out.text, "MCP tool executed successfully");

        let failed = ProtocolToolResult {
            success: false,
            error: Some("server exploded".into()),
            ..Default::default()
        };
        assert_eq!(normalize_protocol_result("t", &failed).text, "server exploded");
    }
}
