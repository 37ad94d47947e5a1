//! Schema simplification
//!
//! Tool input schemas are trimmed before they are forwarded into a
//! size-constrained context such as an LLM function-calling payload.
//! Annotation keywords are dropped and long descriptions are shortened;
//! structure (`type`, `properties`, `required`, `items`, combinators) is
//! kept intact. Simplifying an already simplified schema changes nothing.

use serde_json::{Map, Value};

/// Longest description kept, in characters, including the ellipsis
pub const MAX_DESCRIPTION_CHARS: usize = 200;

const ELLIPSIS: &str = "...";

/// Keywords removed from every schema node
const STRIPPED_KEYWORDS: [&str; 4] = ["title", "examples", "default", "additionalProperties"];

/// Keywords whose value is a map of name to sub-schema
const SCHEMA_MAPS: [&str; 2] = ["properties", "$defs"];

/// Keywords whose value is a list of sub-schemas
const SCHEMA_LISTS: [&str; 3] = ["anyOf", "oneOf", "allOf"];

/// Return a simplified copy of `schema`
pub fn simplify(schema: &Value) -> Value {
    match schema {
        Value::Object(node) => Value::Object(simplify_node(node)),
        other => other.clone(),
    }
}

fn simplify_node(node: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(node.len());

    for (key, value) in node {
        let key = key.as_str();
        if STRIPPED_KEYWORDS.contains(&key) {
            continue;
        }

        let value = match (key, value) {
            ("description", Value::String(text)) => Value::String(truncate(text)),
            (key, Value::Object(children)) if SCHEMA_MAPS.contains(&key) => Value::Object(
                children
                    .iter()
                    .map(|(name, child)| (name.clone(), simplify(child)))
                    .collect(),
            ),
            (key, Value::Array(children)) if SCHEMA_LISTS.contains(&key) => {
                Value::Array(children.iter().map(simplify).collect())
            }
            ("items", Value::Object(_)) => simplify(value),
            ("items", Value::Array(children)) => {
                Value::Array(children.iter().map(simplify).collect())
            }
            _ => value.clone(),
        };
        out.insert(key.to_string(), value);
    }

    out
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_DESCRIPTION_CHARS {
        return text.to_string();
    }
    let keep = MAX_DESCRIPTION_CHARS - ELLIPSIS.len();
    let mut short: String = text.chars().take(keep).collect();
    short.push_str(ELLIPSIS);
    short
}
