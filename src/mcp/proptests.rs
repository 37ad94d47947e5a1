//! Property-Based Tests for the broker
//!
//! - **Qualified names**: any valid server name and any non-empty tool name
//!   (separator included) resolve back to the same pair
//! - **Schema simplification**: idempotent, and never touches `type`,
//!   `properties` keys or `required`
//! - **Retry**: delays stay within `max_delay`
//! - **Inbound parsing**: responses keep their id
//!
//! ```bash
//! cargo test --lib mcp::proptests
//! ```

use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::config::validate_server_name;
use crate::mcp::catalog::{qualify, resolve};
use crate::mcp::protocol::{InboundMessage, McpResponse};
use crate::mcp::retry::RetryConfig;
use crate::mcp::schema::{simplify, MAX_DESCRIPTION_CHARS};

fn arb_server_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,15}".prop_filter("separator in server name", |name| {
        !name.contains("__") && !name.ends_with('_')
    })
}

fn arb_tool_name() -> impl Strategy<Value = String> {
    "[a-zA-Z_][a-zA-Z0-9_.-]{0,20}"
}

fn arb_leaf_schema() -> impl Strategy<Value = Value> {
    (
        prop_oneof![Just("string"), Just("integer"), Just("boolean"), Just("number")],
        proptest::option::of(".{0,300}"),
        proptest::option::of("[a-z ]{0,10}"),
        any::<bool>(),
    )
        .prop_map(|(kind, description, title, default)| {
            let mut node = Map::new();
            node.insert("type".to_string(), json!(kind));
            if let Some(description) = description {
                node.insert("description".to_string(), json!(description));
            }
            if let Some(title) = title {
                node.insert("title".to_string(), json!(title));
            }
            if default {
                node.insert("default".to_string(), Value::Null);
            }
            Value::Object(node)
        })
}

fn arb_schema() -> impl Strategy<Value = Value> {
    arb_leaf_schema().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            (btree_map("[a-z]{1,6}", inner.clone(), 0..4), any::<bool>()).prop_map(
                |(properties, strict)| {
                    let required: Vec<&String> = properties.keys().take(1).collect();
                    json!({
                        "type": "object",
                        "title": "Generated",
                        "additionalProperties": !strict,
                        "properties": properties,
                        "required": required,
                    })
                }
            ),
            inner.clone().prop_map(|items| json!({"type": "array", "items": items})),
            vec(inner, 1..3).prop_map(|choices| json!({"anyOf": choices})),
        ]
    })
}

proptest! {
    #[test]
    fn prop_qualified_name_round_trip(server in arb_server_name(), tool in arb_tool_name()) {
        prop_assert!(validate_server_name(&server).is_ok());

        let qualified = qualify(&server, &tool);
        let (resolved_server, resolved_tool) = resolve(&qualified).unwrap();
        prop_assert_eq!(resolved_server, server.as_str());
        prop_assert_eq!(resolved_tool, tool.as_str());
    }

    #[test]
    fn prop_tool_names_with_separator(
        server in arb_server_name(),
        left in "[a-z]{1,5}",
        right in "[a-z]{1,5}",
    ) {
        let tool = format!("{}__{}", left, right);
        let qualified = qualify(&server, &tool);
        prop_assert_eq!(resolve(&qualified).unwrap(), (server.as_str(), tool.as_str()));
    }

    #[test]
    fn prop_simplify_is_idempotent(schema in arb_schema()) {
        let once = simplify(&schema);
        prop_assert_eq!(simplify(&once), once);
    }

    #[test]
    fn prop_simplify_preserves_structure(schema in arb_schema()) {
        let simplified = simplify(&schema);

        prop_assert_eq!(simplified.get("type"), schema.get("type"));
        prop_assert_eq!(simplified.get("required"), schema.get("required"));
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            let kept = simplified["properties"].as_object().unwrap();
            prop_assert!(properties.keys().eq(kept.keys()));
        }
        prop_assert!(simplified.get("title").is_none());
        prop_assert!(simplified.get("additionalProperties").is_none());
    }

    #[test]
    fn prop_descriptions_are_bounded(description in ".{0,600}") {
        let simplified = simplify(&json!({"type": "string", "description": description}));
        let kept = simplified["description"].as_str().unwrap();
        prop_assert!(kept.chars().count() <= MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn prop_retry_delay_is_capped(
        attempt in 0usize..64,
        base_ms in 1u64..1000,
        jitter in 0.0f64..1.0,
    ) {
        let config = RetryConfig::new()
            .base_delay(Duration::from_millis(base_ms))
            .max_delay(Duration::from_secs(2))
            .jitter(jitter);
        let delay = config.calculate_delay(attempt);
        prop_assert!(delay <= Duration::from_secs(2));
        prop_assert!(delay >= Duration::from_millis(base_ms).min(Duration::from_secs(2)));
    }

    #[test]
    fn prop_inbound_response_keeps_id(id in any::<u64>(), value in any::<i64>()) {
        let line = serde_json::to_string(&McpResponse::ok(id, json!(value))).unwrap();
        let message = InboundMessage::parse_str(&line).unwrap();
        prop_assert_eq!(message.response_id(), Some(id));
    }
}
