//! MCP Protocol Types (JSON-RPC 2.0)
//!
//! This module defines the wire envelopes and payload types exchanged with
//! tool-provider servers. MCP is built on top of JSON-RPC 2.0.
//!
//! # Protocol Specification
//!
//! - JSON-RPC 2.0: <https://www.jsonrpc.org/specification>
//! - MCP Spec: <https://modelcontextprotocol.io/specification/2024-11-05>
//!
//! # Architecture
//!
//! Outbound messages are strongly typed ([`McpRequest`], [`McpNotification`]).
//! Inbound messages are parsed leniently into [`InboundMessage`]: servers in the
//! wild send string ids, odd error objects and extra fields, and the raw
//! tool-call path must still be able to correlate those replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision negotiated during `initialize`
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// A JSON-RPC 2.0 request message
///
/// Requests are sent from the client to the MCP server to invoke methods.
/// Each request has a unique ID (monotonically increasing per connection)
/// to match responses.
///
/// # Example
///
/// ```json
/// {
///   "jsonrpc": "2.0",
///   "id": 1,
///   "method": "tools/call",
///   "params": {"name": "ping", "arguments": {}}
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (used to match responses)
    pub id: u64,

    /// Method name to invoke
    pub method: String,

    /// Method parameters (optional, depends on method)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    /// Create a new MCP request
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (a request without an id; no reply expected)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Notification method
    pub method: String,

    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpNotification {
    /// Create a new notification
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Any message the client writes to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// A request that expects a correlated response
    Request(McpRequest),
    /// A fire-and-forget notification
    Notification(McpNotification),
}

impl OutboundMessage {
    /// Serialize the envelope to a JSON value
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::Request(request) => serde_json::to_value(request),
            Self::Notification(notification) => serde_json::to_value(notification),
        }
    }

    /// Serialize the envelope to a single JSON line (no trailing newline)
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Request(request) => serde_json::to_string(request),
            Self::Notification(notification) => serde_json::to_string(notification),
        }
    }

    /// Request id, if this is a request
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request(request) => Some(request.id),
            Self::Notification(_) => None,
        }
    }

    /// Method name of the envelope
    pub fn method(&self) -> &str {
        match self {
            Self::Request(request) => &request.method,
            Self::Notification(notification) => &notification.method,
        }
    }
}

impl From<McpRequest> for OutboundMessage {
    fn from(request: McpRequest) -> Self {
        Self::Request(request)
    }
}

impl From<McpNotification> for OutboundMessage {
    fn from(notification: McpNotification) -> Self {
        Self::Notification(notification)
    }
}

/// A JSON-RPC 2.0 response message
///
/// A response either contains a `result` or an `error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (must match the request's ID)
    pub id: u64,

    /// Result payload (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl McpResponse {
    /// Create a successful response
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn err(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Get the result, or the error if unsuccessful
    ///
    /// A response carrying neither field resolves to `null`; some servers
    /// answer void methods that way.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// A JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    /// Error code (JSON-RPC defined or MCP-specific)
    pub code: i64,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create a new error
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Method not found (-32601): The method does not exist / is not available
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(-32601, format!("Method not found: {}", method.into()))
    }

    /// Invalid params (-32602): Invalid method parameter(s)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }

    /// Internal error (-32603): Internal JSON-RPC error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(-32603, message)
    }

    /// Server error (-32000): MCP server error
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(-32000, message)
    }

    /// Unauthorized (-32001): credentials missing or rejected
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(-32001, message)
    }

    /// Build an error from whatever a server put in the `error` field
    fn from_loose(value: &Value) -> Self {
        match value {
            Value::Object(fields) => Self {
                code: fields
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(-32603),
                message: match fields.get("message") {
                    Some(Value::String(message)) => message.clone(),
                    Some(other) => other.to_string(),
                    None => "Unknown error".to_string(),
                },
                data: fields.get("data").cloned(),
            },
            Value::String(message) => Self::internal_error(message.clone()),
            other => Self::internal_error(other.to_string()),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Error {}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A message received from a server, classified by shape
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to one of our requests
    Response(McpResponse),

    /// Server notification (no id)
    Notification {
        /// Notification method
        method: String,
        /// Notification parameters
        params: Option<Value>,
    },

    /// Server-initiated request (sampling, roots, ping, ...)
    Request {
        /// Server-chosen id, kept verbatim
        id: Value,
        /// Request method
        method: String,
        /// Request parameters
        params: Option<Value>,
    },
}

impl InboundMessage {
    /// Classify a raw JSON value
    ///
    /// Returns `None` for values that are not JSON-RPC envelopes at all, or
    /// for responses whose id cannot be one of ours (ids are always `u64`).
    pub fn parse(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };

        let id = fields.remove("id").filter(|id| !id.is_null());
        let method = match fields.remove("method") {
            Some(Value::String(method)) => Some(method),
            _ => None,
        };
        let params = fields.remove("params");

        match (method, id) {
            (Some(method), Some(id)) => Some(Self::Request { id, method, params }),
            (Some(method), None) => Some(Self::Notification { method, params }),
            (None, Some(id)) => {
                let id = parse_response_id(&id)?;
                let error = fields
                    .get("error")
                    .filter(|error| !error.is_null())
                    .map(RpcError::from_loose);
                Some(Self::Response(McpResponse {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    result: fields.remove("result"),
                    error,
                }))
            }
            (None, None) => None,
        }
    }

    /// Parse a JSON text line
    pub fn parse_str(text: &str) -> Option<Self> {
        serde_json::from_str::<Value>(text).ok().and_then(Self::parse)
    }

    /// The correlation id if this is a response
    pub fn response_id(&self) -> Option<u64> {
        match self {
            Self::Response(response) => Some(response.id),
            _ => None,
        }
    }
}

fn parse_response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// MCP method identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum McpMethod {
    /// Initialize the connection (must be called first)
    Initialize,

    /// Client notification sent after a successful `initialize`
    Initialized,

    /// List available tools
    ToolsList,

    /// Call a specific tool
    ToolsCall,

    /// List available resources
    ResourcesList,

    /// Read a resource
    ResourcesRead,

    /// List available prompts
    PromptsList,

    /// Get a prompt
    PromptsGet,

    /// Custom method (for extensibility)
    Custom(String),
}

impl McpMethod {
    /// Convert to string for JSON-RPC method field
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialize => "initialize",
            Self::Initialized => "notifications/initialized",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
            Self::PromptsList => "prompts/list",
            Self::PromptsGet => "prompts/get",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl From<&str> for McpMethod {
    fn from(s: &str) -> Self {
        match s {
            "initialize" => Self::Initialize,
            "notifications/initialized" => Self::Initialized,
            "tools/list" => Self::ToolsList,
            "tools/call" => Self::ToolsCall,
            "resources/list" => Self::ResourcesList,
            "resources/read" => Self::ResourcesRead,
            "prompts/list" => Self::PromptsList,
            "prompts/get" => Self::PromptsGet,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Initialization parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitializeParams {
    /// Client protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Client capabilities
    pub capabilities: ClientCapabilities,

    /// Client information
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

impl InitializeParams {
    /// Parameters this crate sends during the handshake
    pub fn for_this_client() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Client capabilities advertised during initialization
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Sampling capability (object or null)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,

    /// Experimental features
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Client identification information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client name
    pub name: String,

    /// Client version
    pub version: String,
}

/// Result of the `initialize` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitializeResult {
    /// Server protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Server capabilities
    #[serde(default)]
    pub capabilities: Value,

    /// Server information
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Server identification information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server name
    pub name: String,

    /// Server version
    pub version: String,
}

/// Tool definition as advertised by a server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// Tool name (unique per server)
    pub name: String,

    /// Tool description
    #[serde(default)]
    pub description: String,

    /// Tool input schema (JSON Schema)
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Tool call parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallParams {
    /// Name of the tool to call
    pub name: String,

    /// Tool arguments (must match input schema)
    pub arguments: Value,
}

/// `tools/list` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListToolsResult {
    /// Advertised tools
    pub tools: Vec<Tool>,

    /// Pagination cursor
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Resource descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    /// Resource URI
    pub uri: String,

    /// Display name
    pub name: String,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// MIME type
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// `resources/list` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListResourcesResult {
    /// Advertised resources
    pub resources: Vec<Resource>,

    /// Pagination cursor
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Contents of one resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceContents {
    /// Resource URI
    pub uri: String,

    /// MIME type
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Text body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Base64 body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// `resources/read` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResourceResult {
    /// Resource contents
    pub contents: Vec<ResourceContents>,
}

/// Prompt argument descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the argument must be supplied
    #[serde(default)]
    pub required: bool,
}

/// Prompt descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt name
    pub name: String,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared arguments
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// `prompts/list` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListPromptsResult {
    /// Advertised prompts
    pub prompts: Vec<Prompt>,

    /// Pagination cursor
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// One rendered prompt message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMessage {
    /// "user" or "assistant"
    pub role: String,

    /// Content block (text, image, embedded resource)
    pub content: Value,
}

/// `prompts/get` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetPromptResult {
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Rendered messages
    pub messages: Vec<PromptMessage>,
}
