//! Tool parameter schema repair.
//!
//! Backends reject a whole request when a single tool carries a malformed
//! JSON Schema. Every definition is therefore repaired before it is sent:
//! array properties get an `items` schema, `required` only names existing
//! properties, and the top level is always an object. A definition that is
//! still invalid afterwards is replaced by a stub with an empty schema, so
//! the model can at least see the tool's name.

use serde_json::{Map, Value, json};
use toolpilot_core::ToolDefinition;
use tracing::{debug, warn};

const STUB_MARKER: &str = " (Schema validation failed)";

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {}, "required": [] })
}

/// Element type for an array property that lacks `items`, guessed from its name.
pub fn infer_items_type(property_name: &str) -> &'static str {
    let name = property_name.to_lowercase();
    if name.contains("number") || name.contains("id") {
        "number"
    } else if name.contains("boolean") || name.contains("flag") {
        "boolean"
    } else {
        "string"
    }
}

/// Repair a parameters schema. Already-valid schemas come back unchanged.
pub fn sanitize_parameters(schema: &Value, tool_name: &str) -> Value {
    let Value::Object(map) = schema else {
        warn!(tool = %tool_name, "Parameters schema is not an object, using empty schema");
        return empty_schema();
    };

    let mut sanitized = map.clone();

    if sanitized.get("type").and_then(Value::as_str) != Some("object") {
        debug!(tool = %tool_name, "Forcing top-level schema type to object");
        sanitized.insert("type".into(), json!("object"));
    }
    if !sanitized.get("properties").is_some_and(Value::is_object) {
        sanitized.insert("properties".into(), json!({}));
    }
    if !sanitized.contains_key("required") {
        sanitized.insert("required".into(), json!([]));
    }

    sanitize_members(&mut sanitized, tool_name);
    Value::Object(sanitized)
}

/// Repair `properties` and `required` of an object schema in place.
fn sanitize_members(schema: &mut Map<String, Value>, path: &str) {
    if let Some(Value::Object(properties)) = schema.get_mut("properties") {
        for (name, prop) in properties.iter_mut() {
            sanitize_property(name, prop, &format!("{path}.{name}"));
        }
    }

    let property_names: Vec<String> = match schema.get("properties") {
        Some(Value::Object(properties)) => properties.keys().cloned().collect(),
        _ => Vec::new(),
    };

    if let Some(Value::Array(required)) = schema.get_mut("required") {
        let before = required.len();
        required.retain(|entry| {
            entry
                .as_str()
                .is_some_and(|name| property_names.iter().any(|p| p == name))
        });
        if required.len() != before {
            debug!(path = %path, removed = before - required.len(), "Pruned dangling required entries");
        }
    }
}

fn sanitize_property(name: &str, prop: &mut Value, path: &str) {
    if !prop.is_object() {
        debug!(path = %path, "Property schema is not an object, defaulting to string");
        *prop = json!({ "type": "string" });
        return;
    }
    let Some(prop) = prop.as_object_mut() else { return };

    if prop.get("type").and_then(Value::as_str) == Some("array") {
        let repaired_items = match prop.get("items") {
            None | Some(Value::Null) => {
                let items_type = infer_items_type(name);
                debug!(path = %path, items_type, "Adding missing items for array property");
                Some(json!({ "type": items_type }))
            }
            Some(Value::Object(items)) if !items.contains_key("type") => {
                let mut items = items.clone();
                items.insert("type".into(), json!("string"));
                Some(Value::Object(items))
            }
            Some(Value::Object(_)) => None,
            Some(_) => Some(json!({ "type": "string" })),
        };
        if let Some(items) = repaired_items {
            prop.insert("items".into(), items);
        }
    }

    if !prop.contains_key("type") {
        prop.insert("type".into(), json!("string"));
    }

    if prop.get("type").and_then(Value::as_str) == Some("object")
        && prop.get("properties").is_some_and(Value::is_object)
    {
        sanitize_members(prop, path);
    }
}

/// Structural problems of a parameters schema; empty means valid.
pub fn validate_parameters(schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_object(schema, "parameters", &mut errors);
    errors
}

fn validate_object(schema: &Value, path: &str, errors: &mut Vec<String>) {
    let Value::Object(schema) = schema else {
        errors.push(format!("{path}: schema must be an object"));
        return;
    };

    match schema.get("type").and_then(Value::as_str) {
        None => errors.push(format!("{path}: missing 'type'")),
        Some("object") => {}
        Some(_) => errors.push(format!("{path}: type must be 'object'")),
    }

    if schema.get("properties").is_some_and(|p| !p.is_object()) {
        errors.push(format!("{path}: 'properties' must be an object"));
    }
    if schema.get("required").is_some_and(|r| !r.is_array()) {
        errors.push(format!("{path}: 'required' must be an array"));
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(properties) = properties {
        for (name, prop) in properties {
            let prop_path = format!("{path}.properties.{name}");
            let Some(prop) = prop.as_object() else { continue };

            match prop.get("type").and_then(Value::as_str) {
                None => errors.push(format!("{prop_path}: missing 'type'")),
                Some("array") => match prop.get("items") {
                    None => errors.push(format!("{prop_path}: array type must have 'items'")),
                    Some(Value::Object(items)) if !items.contains_key("type") => {
                        errors.push(format!("{prop_path}.items: missing 'type'"))
                    }
                    Some(Value::Object(_)) => {}
                    Some(_) => errors.push(format!("{prop_path}: 'items' must be an object")),
                },
                Some("object") if prop.get("properties").is_some() => {
                    validate_object(&Value::Object(prop.clone()), &prop_path, errors);
                }
                Some(_) => {}
            }
        }
    }

    if let (Some(Value::Array(required)), Some(properties)) = (schema.get("required"), properties) {
        for entry in required {
            match entry.as_str() {
                None => errors.push(format!("{path}: required entries must be strings")),
                Some(name) if !properties.contains_key(name) => {
                    errors.push(format!("{path}: required property '{name}' does not exist"))
                }
                Some(_) => {}
            }
        }
    }
}

/// Repair one definition, falling back to a stub when repair is not enough.
pub fn sanitize_definition(definition: ToolDefinition) -> ToolDefinition {
    let ToolDefinition { name, description, parameters } = definition;

    let description = if description.trim().is_empty() {
        format!("Tool: {name}")
    } else {
        description
    };

    let parameters = sanitize_parameters(&parameters, &name);
    let errors = validate_parameters(&parameters);
    if errors.is_empty() {
        return ToolDefinition { name, description, parameters };
    }

    warn!(tool = %name, errors = ?errors, "Tool schema still invalid after repair, substituting stub");
    ToolDefinition {
        description: format!("{description}{STUB_MARKER}"),
        name,
        parameters: empty_schema(),
    }
}

/// Repair a batch of definitions. Definitions without a name are dropped.
pub fn sanitize_definitions(definitions: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    let total = definitions.len();
    let sanitized: Vec<ToolDefinition> = definitions
        .into_iter()
        .filter(|d| {
            let keep = !d.name.trim().is_empty();
            if !keep {
                warn!("Dropping tool definition with empty name");
            }
            keep
        })
        .map(sanitize_definition)
        .collect();
    debug!(kept = sanitized.len(), total, "Sanitized tool definitions");
    sanitized
}
