use jsonschema::JSONSchema;
use schemars::JsonSchema;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("malformed output: {0}")]
    Malformed(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

/// Pull a JSON object out of untrusted model text. Tolerates fenced code
/// blocks and prose before/after the object.
pub fn extract_json(text: &str) -> Result<Value, OutputError> {
    let trimmed = text.trim();
    let candidate = if let Some(inner) = strip_fences(trimmed) {
        inner
    } else if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let start = trimmed
            .find('{')
            .ok_or_else(|| OutputError::Malformed("no JSON object found in output".into()))?;
        let end = trimmed
            .rfind('}')
            .ok_or_else(|| OutputError::Malformed("no closing brace found in output".into()))?;
        if end < start {
            return Err(OutputError::Malformed("no JSON object found in output".into()));
        }
        trimmed[start..=end].to_string()
    };
    serde_json::from_str(&candidate).map_err(|e| OutputError::Malformed(e.to_string()))
}

fn strip_fences(text: &str) -> Option<String> {
    let rest = text.strip_prefix("```")?;
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.rfind("```")?;
    Some(rest[..end].trim().to_string())
}

/// Validate a value against a JSON schema, reporting the failing path and
/// constraint so the model can correct itself.
pub fn validate(value: &Value, schema: &Value) -> Result<(), OutputError> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| OutputError::SchemaViolation(format!("invalid schema: {e}")))?;
    let details: Vec<String> = match compiled.validate(value) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect(),
    };
    Err(OutputError::SchemaViolation(details.join("; ")))
}

pub fn parse_structured(text: &str, schema: &Value) -> Result<Value, OutputError> {
    let value = extract_json(text)?;
    validate(&value, schema)?;
    Ok(value)
}

/// JSON schema for a type, with titles stripped so the prompt stays compact.
pub fn schema_for<T: JsonSchema>() -> Value {
    let root = schemars::schema_for!(T);
    let mut value = serde_json::to_value(root).unwrap_or(Value::Null);
    strip_titles(&mut value);
    value
}

fn strip_titles(schema: &mut Value) {
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("title");
        obj.remove("$schema");
        if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
            for prop in props.values_mut() {
                if let Some(p) = prop.as_object_mut() {
                    p.remove("title");
                }
            }
        }
        if let Some(defs) = obj.get_mut("definitions").and_then(Value::as_object_mut) {
            for def in defs.values_mut() {
                strip_titles(def);
            }
        }
    }
}

/// OpenAI-style function-calling wire format for one tool.
pub fn tool_schema(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
            "strict": true,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct Review {
        role: String,
        score: f64,
    }

    #[test]
    fn extracts_plain_object() {
        let v = extract_json(r#"{"role": "X", "score": 80}"#).unwrap();
        assert_eq!(v["role"], "X");
    }

    #[test]
    fn extracts_fenced_object() {
        let v = extract_json("```json\n{\"role\": \"X\", \"score\": 80}\n```").unwrap();
        assert_eq!(v["score"], 80);
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let text = "Here is the result:\n{\"role\": \"X\", \"score\": 80}\nHope that helps!";
        let v = extract_json(text).unwrap();
        assert_eq!(v["role"], "X");
    }

    #[test]
    fn truncated_object_is_malformed() {
        let err = extract_json(r#"{"role": "X""#).unwrap_err();
        assert!(matches!(err, OutputError::Malformed(_)));
    }

    #[test]
    fn no_object_is_malformed() {
        let err = extract_json("sorry, I cannot do that").unwrap_err();
        assert!(matches!(err, OutputError::Malformed(_)));
    }

    #[test]
    fn validation_names_the_failing_field() {
        let schema = schema_for::<Review>();
        let err = validate(&serde_json::json!({"role": "X"}), &schema).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("score"), "unexpected message: {msg}");
    }

    #[test]
    fn parse_structured_accepts_valid_output() {
        let schema = schema_for::<Review>();
        let v = parse_structured(r#"{"role": "X", "score": 80}"#, &schema).unwrap();
        assert_eq!(v["score"], 80);
    }

    #[test]
    fn schema_has_no_titles() {
        let schema = schema_for::<Review>();
        assert!(schema.get("title").is_none());
        assert!(schema.get("$schema").is_none());
        let props = schema["properties"].as_object().unwrap();
        assert!(props["role"].get("title").is_none());
    }

    #[test]
    fn tool_schema_wire_shape() {
        let t = tool_schema("browser_navigate", "Navigate to a URL", json!({"type": "object"}));
        assert_eq!(t["type"], "function");
        assert_eq!(t["function"]["name"], "browser_navigate");
        assert_eq!(t["function"]["strict"], true);
    }
}
