//! Tool Catalog
//!
//! Flattens the tools of every live connection into one namespaced list.
//! A tool is addressed as `<server>__<tool>`; server names may not contain
//! the separator, tool names may.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ServerConfig;
use crate::mcp::connection::Connection;
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::schema;

/// Separator between server and tool in a qualified name
pub const QUALIFIED_NAME_SEPARATOR: &str = "__";

/// Tool name used for the "login required" placeholder
pub const PLACEHOLDER_TOOL_NAME: &str = "authenticate";

/// Join a server and tool name
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{}{}{}", server, QUALIFIED_NAME_SEPARATOR, tool)
}

/// Split a qualified name at the first separator
pub fn resolve(qualified: &str) -> BrokerResult<(&str, &str)> {
    match qualified.split_once(QUALIFIED_NAME_SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(BrokerError::InvalidToolName(qualified.to_string())),
    }
}

/// One entry of the aggregated catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogTool {
    /// Tool name as advertised by the server
    pub name: String,
    /// `<server>__<tool>`
    pub qualified_name: String,
    /// Description
    pub description: String,
    /// JSON Schema for the arguments
    pub input_schema: Value,
    /// Owning server
    pub server: String,
    /// Reaching this tool needed a session credential
    pub requires_auth: bool,
    /// Backed by a live connection
    pub connected: bool,
    /// Stand-in for a server that needs a login first
    pub placeholder: bool,
}

impl CatalogTool {
    fn from_connection(connection: &Connection, requires_auth: bool) -> Vec<Self> {
        let server = connection.server_name();
        connection
            .tools()
            .into_iter()
            .map(|tool| Self {
                qualified_name: qualify(server, &tool.name),
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                server: server.to_string(),
                requires_auth,
                connected: true,
                placeholder: false,
            })
            .collect()
    }

    fn placeholder(config: &ServerConfig) -> Self {
        let mut description = format!(
            "Login required: MCP server '{}' needs authentication before its tools are available.",
            config.name
        );
        if !config.description.is_empty() {
            description.push(' ');
            description.push_str(&config.description);
        }

        Self {
            name: PLACEHOLDER_TOOL_NAME.to_string(),
            qualified_name: qualify(&config.name, PLACEHOLDER_TOOL_NAME),
            description,
            input_schema: json!({"type": "object", "properties": {}}),
            server: config.name.clone(),
            requires_auth: true,
            connected: false,
            placeholder: true,
        }
    }

    /// Function-calling shape with a simplified schema
    pub fn to_llm_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.qualified_name,
                "description": self.description,
                "parameters": schema::simplify(&self.input_schema),
            }
        })
    }
}

/// Merge the catalogs of live connections
///
/// `configs` drives the order. Servers without `requires_auth` contribute
/// their shared connection; servers with it contribute the session
/// connection, or a single placeholder when there is none.
pub fn aggregate(
    configs: &[ServerConfig],
    shared: &[Arc<Connection>],
    session: &[Arc<Connection>],
) -> Vec<CatalogTool> {
    let live = |connections: &[Arc<Connection>], name: &str| {
        connections
            .iter()
            .find(|connection| connection.server_name() == name && connection.is_connected())
            .cloned()
    };

    let mut tools = Vec::new();
    for config in configs {
        if config.requires_auth {
            match live(session, &config.name) {
                Some(connection) => tools.extend(CatalogTool::from_connection(&connection, true)),
                None => tools.push(CatalogTool::placeholder(config)),
            }
        } else if let Some(connection) = live(shared, &config.name) {
            tools.extend(CatalogTool::from_connection(&connection, false));
        }
    }
    tools
}

/// Function-calling payloads for every real tool in `tools`
pub fn llm_tools(tools: &[CatalogTool]) -> Vec<Value> {
    tools
        .iter()
        .filter(|tool| !tool.placeholder)
        .map(CatalogTool::to_llm_tool)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_and_resolve() {
        assert_eq!(qualify("echo", "ping"), "echo__ping");
        assert_eq!(resolve("echo__ping").unwrap(), ("echo", "ping"));
    }

    #[test]
    fn test_resolve_tool_name_with_separator() {
        let qualified = qualify("files", "read__raw");
        assert_eq!(resolve(&qualified).unwrap(), ("files", "read__raw"));
    }

    #[test]
    fn test_resolve_rejects_malformed_names() {
        assert!(matches!(resolve("noseparator"), Err(BrokerError::InvalidToolName(_))));
        assert!(resolve("__tool").is_err());
        assert!(resolve("server__").is_err());
        assert!(resolve("").is_err());
    }

    #[test]
    fn test_placeholder_for_auth_server_without_connection() {
        let configs = vec![
            ServerConfig::simulated("files", "files")
                .with_requires_auth(true)
                .with_description("Team drive"),
            ServerConfig::simulated("echo", "echo"),
        ];

        let tools = aggregate(&configs, &[], &[]);
        assert_eq!(tools.len(), 1);

        let placeholder = &tools[0];
        assert!(placeholder.placeholder);
        assert!(placeholder.requires_auth);
        assert!(!placeholder.connected);
        assert_eq!(placeholder.qualified_name, "files__authenticate");
        assert!(placeholder.description.contains("Login required"));
        assert!(placeholder.description.ends_with("Team drive"));
    }

    #[test]
    fn test_llm_tools_skip_placeholders() {
        let configs = vec![ServerConfig::simulated("files", "files").with_requires_auth(true)];
        let tools = aggregate(&configs, &[], &[]);
        assert!(llm_tools(&tools).is_empty());
    }

    #[test]
    fn test_llm_tool_shape() {
        let tool = CatalogTool {
            name: "ping".to_string(),
            qualified_name: "echo__ping".to_string(),
            description: "Ping".to_string(),
            input_schema: json!({
                "type": "object",
                "title": "PingArgs",
                "properties": {"host": {"type": "string", "default": "localhost"}},
                "required": ["host"]
            }),
            server: "echo".to_string(),
            requires_auth: false,
            connected: true,
            placeholder: false,
        };

        let llm = tool.to_llm_tool();
        assert_eq!(llm["type"], "function");
        assert_eq!(llm["function"]["name"], "echo__ping");
        assert_eq!(
            llm["function"]["parameters"],
            json!({
                "type": "object",
                "properties": {"host": {"type": "string"}},
                "required": ["host"]
            })
        );
    }
}
