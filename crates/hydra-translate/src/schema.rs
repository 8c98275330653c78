//! JSON-schema scrubbing for tool parameters.
//!
//! Providers accept different subsets of JSON-schema. Gemini/Vertex reject a
//! handful of keywords outright; Claude wants a draft 2020-12 `$schema` on
//! empty parameter objects. Cleaning never mutates the caller's value, and a
//! process-wide cache short-circuits repeat schemas.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Map, Value};

use hydra_protocol::{Message, ToolSpec};

/// Keywords Gemini/Vertex reject, stripped at every depth.
const GEMINI_STRIPPED_KEYS: &[&str] = &[
    "$ref",
    "$defs",
    "$schema",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
];

/// Keys whose values are themselves schemas (or maps/arrays of schemas).
const NESTED_SCHEMA_KEYS: &[&str] = &["items", "additionalProperties", "not", "contains"];
const NESTED_SCHEMA_MAP_KEYS: &[&str] = &["properties", "patternProperties"];
const NESTED_SCHEMA_LIST_KEYS: &[&str] = &["anyOf", "oneOf", "allOf", "prefixItems"];

fn clean_gemini_inner(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (key, val) in obj {
                if GEMINI_STRIPPED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let cleaned = if NESTED_SCHEMA_KEYS.contains(&key.as_str()) {
                    clean_gemini_inner(val)
                } else if NESTED_SCHEMA_MAP_KEYS.contains(&key.as_str()) {
                    match val {
                        Value::Object(props) => Value::Object(
                            props
                                .iter()
                                .map(|(name, schema)| (name.clone(), clean_gemini_inner(schema)))
                                .collect(),
                        ),
                        other => other.clone(),
                    }
                } else if NESTED_SCHEMA_LIST_KEYS.contains(&key.as_str()) {
                    match val {
                        Value::Array(items) => {
                            Value::Array(items.iter().map(clean_gemini_inner).collect())
                        }
                        other => other.clone(),
                    }
                } else {
                    val.clone()
                };
                out.insert(key.clone(), cleaned);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Scrub cache: serialized input schema → cleaned copy.
fn clean_cache() -> &'static DashMap<String, Arc<Value>> {
    static CACHE: std::sync::OnceLock<DashMap<String, Arc<Value>>> = std::sync::OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Return a Gemini-safe copy of `schema`. Idempotent; the input is never
/// mutated. Repeat schemas hit the cache instead of re-walking.
pub fn clean_json_schema_for_gemini(schema: &Value) -> Value {
    let key = schema.to_string();
    if let Some(hit) = clean_cache().get(&key) {
        return hit.value().as_ref().clone();
    }
    let cleaned = clean_gemini_inner(schema);
    clean_cache().insert(key, Arc::new(cleaned.clone()));
    cleaned
}

/// Claude rejects tools whose `input_schema` lacks structure; empty parameter
/// sets get an explicit draft 2020-12 envelope.
pub fn schema_for_claude(schema: &Value) -> Value {
    let is_empty = match schema {
        Value::Null => true,
        Value::Object(obj) => {
            obj.is_empty()
                || obj
                    .get("properties")
                    .map(|p| p.as_object().map(|m| m.is_empty()).unwrap_or(false))
                    .unwrap_or(false)
                    && obj.len() <= 2
        }
        _ => false,
    };
    if is_empty {
        json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "type": "object",
            "properties": {},
        })
    } else {
        schema.clone()
    }
}

/// Lookup tables the stream translator and Gemini emitter need: tool name →
/// parameter schema (for argument coercion) and call id → tool name (Gemini
/// `functionResponse` carries a name, not an id).
///
/// Building is pure: the same input always produces the same maps.
#[derive(Debug, Clone, Default)]
pub struct ToolMaps {
    pub params_by_name: HashMap<String, Value>,
    pub name_by_call_id: HashMap<String, String>,
}

impl ToolMaps {
    pub fn build(tools: &[ToolSpec], messages: &[Message]) -> Self {
        let mut maps = ToolMaps::default();
        for tool in tools {
            maps.params_by_name
                .insert(tool.name.clone(), tool.parameters.clone());
        }
        for msg in messages {
            for call in &msg.tool_calls {
                maps.name_by_call_id
                    .insert(call.id.clone(), call.name.clone());
            }
        }
        maps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_protocol::{Role, ToolCall};

    fn nested_schema() -> Value {
        json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "properties": {
                "count": { "type": "integer", "minimum": 0, "maximum": 10 },
                "tags": {
                    "type": "array",
                    "minItems": 1,
                    "items": { "type": "string", "$ref": "#/defs/tag" }
                }
            },
            "$defs": { "tag": { "type": "string" } }
        })
    }

    #[test]
    fn gemini_strip_reaches_every_depth() {
        let cleaned = clean_json_schema_for_gemini(&nested_schema());
        assert!(cleaned.get("$defs").is_none());
        assert!(cleaned.get("$schema").is_none());
        let count = &cleaned["properties"]["count"];
        assert!(count.get("minimum").is_none());
        assert!(count.get("maximum").is_none());
        let tags = &cleaned["properties"]["tags"];
        assert!(tags.get("minItems").is_none());
        assert!(tags["items"].get("$ref").is_none());
        assert_eq!(tags["items"]["type"], "string");
    }

    #[test]
    fn gemini_clean_is_idempotent() {
        let once = clean_json_schema_for_gemini(&nested_schema());
        let twice = clean_json_schema_for_gemini(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn gemini_clean_does_not_mutate_input() {
        let original = nested_schema();
        let _ = clean_json_schema_for_gemini(&original);
        assert_eq!(original, nested_schema());
    }

    #[test]
    fn claude_empty_schema_gains_envelope() {
        let out = schema_for_claude(&json!({}));
        assert_eq!(
            out["$schema"],
            "https://json-schema.org/draft/2020-12/schema"
        );
        assert_eq!(out["type"], "object");
    }

    #[test]
    fn claude_nonempty_schema_passes_through() {
        let schema = json!({"type": "object", "properties": {"q": {"type": "string"}}});
        assert_eq!(schema_for_claude(&schema), schema);
    }

    #[test]
    fn tool_maps_stable_under_rebuild() {
        let tools = vec![ToolSpec {
            name: "search".into(),
            description: "find things".into(),
            parameters: json!({"type": "object"}),
        }];
        let mut msg = Message::new(Role::Assistant);
        msg.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "search".into(),
            arguments: "{}".into(),
            thought_signature: None,
        });
        let msgs = vec![msg];
        let a = ToolMaps::build(&tools, &msgs);
        let b = ToolMaps::build(&tools, &msgs);
        assert_eq!(a.params_by_name.len(), b.params_by_name.len());
        assert_eq!(
            a.name_by_call_id.get("call_1"),
            b.name_by_call_id.get("call_1")
        );
    }
}
