//! Invocation Router
//!
//! Resolves a server to the connection a caller should use and forwards tool
//! calls over the raw path. A live session connection wins over the shared
//! one. For servers with `requires_auth`, a missing session connection is
//! opened on the spot when the caller brings a session id and token.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::config::ServerConfig;
use crate::mcp::connection::Connection;
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::registry::ConnectionRegistry;
use crate::metrics;

/// Argument field carrying an on-behalf-of token to the remote tool
pub const OBO_TOKEN_FIELD: &str = "_obo_token";

/// Add the on-behalf-of token to tool arguments
///
/// Non-object arguments are passed through untouched; `null` becomes an
/// object holding only the token.
pub fn merge_obo_token(arguments: Value, token: Option<&str>) -> Value {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return arguments;
    };

    match arguments {
        Value::Object(mut fields) => {
            fields.insert(OBO_TOKEN_FIELD.to_string(), Value::String(token.to_string()));
            Value::Object(fields)
        }
        Value::Null => {
            let mut fields = Map::new();
            fields.insert(OBO_TOKEN_FIELD.to_string(), Value::String(token.to_string()));
            Value::Object(fields)
        }
        other => {
            tracing::debug!("Tool arguments are not an object; on-behalf-of token not attached");
            other
        }
    }
}

/// Pick the connection for `config`
///
/// 1. a live session connection, when `session_id` is given
/// 2. for `requires_auth` servers: a new session connection built from
///    `token`, else [`BrokerError::AuthRequired`]
/// 3. the live shared connection, else [`BrokerError::NotConnected`]
pub async fn resolve_connection(
    registry: &ConnectionRegistry,
    config: &ServerConfig,
    session_id: Option<&str>,
    token: Option<&str>,
) -> BrokerResult<Arc<Connection>> {
    if let Some(session_id) = session_id {
        if let Some(connection) = registry.session(session_id, &config.name) {
            if connection.is_connected() {
                return Ok(connection);
            }
        }
    }

    if config.requires_auth {
        return match (session_id, token) {
            (Some(session_id), Some(token)) if !token.is_empty() => {
                registry
                    .get_or_create_session_connection(session_id, config, token)
                    .await
            }
            _ => Err(BrokerError::AuthRequired(config.name.clone())),
        };
    }

    match registry.shared(&config.name) {
        Some(connection) if connection.is_connected() => Ok(connection),
        _ => Err(BrokerError::NotConnected(config.name.clone())),
    }
}

/// Resolve a connection and call `tool` on it
pub async fn invoke(
    registry: &ConnectionRegistry,
    config: &ServerConfig,
    tool: &str,
    arguments: Value,
    session_id: Option<&str>,
    token: Option<&str>,
) -> BrokerResult<Value> {
    let connection = resolve_connection(registry, config, session_id, token).await?;
    let arguments = merge_obo_token(arguments, token);

    let started = Instant::now();
    let result = connection.call_tool_raw(tool, arguments).await;
    metrics::record_tool_call(&config.name, result.is_ok(), started.elapsed());

    if let Err(e) = &result {
        tracing::debug!("Tool '{}' on MCP server '{}' failed: {}", tool, config.name, e);
    }
    result
}
