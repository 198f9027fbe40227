//! JSON-schema constrained replies for generate nodes.

use serde::Deserialize;
use tracing::{debug, warn};

/// One field of the requested reply object.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaProperty {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_type", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

fn default_type() -> String {
    "string".into()
}

/// `structuredOutput` block of a generate node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StructuredOutput {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub properties: Vec<SchemaProperty>,
}

impl StructuredOutput {
    pub fn is_active(&self) -> bool {
        self.enabled && self.properties.iter().any(|p| !p.name.is_empty())
    }

    /// Object schema built from the configured properties.
    pub fn schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for prop in self.properties.iter().filter(|p| !p.name.is_empty()) {
            properties.insert(
                prop.name.clone(),
                serde_json::json!({"type": prop.kind, "description": prop.description}),
            );
            if prop.required {
                required.push(serde_json::Value::String(prop.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Text appended to the system prompt.
    pub fn instructions(&self) -> String {
        let schema = serde_json::to_string_pretty(&self.schema()).unwrap_or_default();
        format!(
            "\n\nYou must respond in the following JSON format that matches this JSON schema:\n\
             {schema}\n\n\
             Your response must be valid JSON that conforms to this schema. \
             Do not include any text outside of the JSON object."
        )
    }
}

/// Outcome of checking a reply against the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredReply {
    /// Parsed object when valid, raw text otherwise.
    pub value: serde_json::Value,
    pub valid: bool,
    pub error: Option<String>,
}

/// Pull a JSON value out of a model reply.
///
/// Accepts a bare object, a ```json fenced block, or the outermost
/// `{...}` span of surrounding prose.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(v);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = body.find("```") {
            if let Ok(v) = serde_json::from_str(body[..end].trim()) {
                return Some(v);
            }
        }
    }

    let open = trimmed.find('{')?;
    let close = trimmed.rfind('}')?;
    if close <= open {
        return None;
    }
    serde_json::from_str(&trimmed[open..=close]).ok()
}

/// Parse and validate a reply against `schema`.
pub fn validate_reply(schema: &serde_json::Value, reply: &str) -> StructuredReply {
    let raw = || serde_json::Value::String(reply.to_string());

    let Some(parsed) = extract_json(reply) else {
        warn!("Structured output requested but no JSON found in reply");
        return StructuredReply {
            value: raw(),
            valid: false,
            error: Some("No JSON found in response".into()),
        };
    };

    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(c) => c,
        Err(e) => {
            return StructuredReply {
                value: raw(),
                valid: false,
                error: Some(format!("Invalid schema: {e}")),
            }
        }
    };

    let error = match compiled.validate(&parsed) {
        Ok(()) => None,
        Err(errors) => Some(
            errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        ),
    };

    match error {
        None => {
            debug!("Structured output validated");
            StructuredReply {
                value: parsed,
                valid: true,
                error: None,
            }
        }
        Some(message) => {
            warn!(error = %message, "Structured output failed validation");
            StructuredReply {
                value: raw(),
                valid: false,
                error: Some(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> StructuredOutput {
        serde_json::from_value(json!({
            "enabled": true,
            "properties": [
                {"name": "title", "type": "string", "description": "Headline", "required": true},
                {"name": "score", "type": "number", "required": false},
                {"name": "", "type": "string"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_schema_from_properties() {
        let schema = config().schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["title"]["type"], "string");
        assert_eq!(schema["properties"]["score"]["type"], "number");
        assert_eq!(schema["required"], json!(["title"]));
        assert_eq!(schema["properties"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_inactive_without_named_properties() {
        let cfg = StructuredOutput {
            enabled: true,
            properties: vec![],
        };
        assert!(!cfg.is_active());
        assert!(config().is_active());
    }

    #[test]
    fn test_instructions_embed_schema() {
        let text = config().instructions();
        assert!(text.contains("\"title\""));
        assert!(text.contains("Do not include any text outside of the JSON object."));
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("```json\n{\"a\": 2}\n```"),
            Some(json!({"a": 2}))
        );
        assert_eq!(
            extract_json("Sure! Here it is: {\"a\": 3} hope that helps"),
            Some(json!({"a": 3}))
        );
        assert_eq!(extract_json("no json at all"), None);
    }

    #[test]
    fn test_valid_reply() {
        let reply = validate_reply(&config().schema(), r#"{"title": "Hi", "score": 4.5}"#);
        assert!(reply.valid);
        assert_eq!(reply.value["title"], "Hi");
        assert!(reply.error.is_none());
    }

    #[test]
    fn test_invalid_reply_keeps_raw_text() {
        let text = r#"{"score": "high"}"#;
        let reply = validate_reply(&config().schema(), text);
        assert!(!reply.valid);
        assert_eq!(reply.value, json!(text));
        assert!(reply.error.is_some());
    }

    #[test]
    fn test_reply_without_json() {
        let reply = validate_reply(&config().schema(), "I cannot do that");
        assert!(!reply.valid);
        assert_eq!(reply.error.as_deref(), Some("No JSON found in response"));
    }
}
