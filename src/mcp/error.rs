//! Broker Error Types
//!
//! Every operation of the connection layer fails with a [`BrokerError`].
//! The core never retries; callers decide what to do with each variant
//! (see [`BrokerError::is_transient`]).

use crate::mcp::protocol::RpcError;

/// Error types for connection, routing and invocation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// No server with this name is configured
    #[error("MCP server '{0}' is not configured")]
    ConfigNotFound(String),

    /// A server configuration was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The handshake did not finish within the configured timeout
    #[error("Connecting to MCP server '{server}' timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Server name
        server: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Process spawn failure, pipe failure or HTTP stream error
    #[error("Transport error for MCP server '{server}': {reason}")]
    Transport {
        /// Server name
        server: String,
        /// What went wrong
        reason: String,
    },

    /// No correlated response arrived in time
    #[error("Request '{method}' to MCP server '{server}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Server name
        server: String,
        /// JSON-RPC method
        method: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// The server answered a tool call with an error envelope
    #[error("Tool '{tool}' on MCP server '{server}' failed: [{code}] {message}")]
    RemoteTool {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// JSON-RPC error code
        code: i64,
        /// Server-reported message
        message: String,
    },

    /// The server answered a validated-path request with an error envelope
    #[error("MCP server '{server}' rejected '{method}': [{code}] {message}")]
    Rpc {
        /// Server name
        server: String,
        /// JSON-RPC method
        method: String,
        /// JSON-RPC error code
        code: i64,
        /// Server-reported message
        message: String,
    },

    /// A validated-path payload did not match the expected schema
    #[error("Invalid '{method}' response from MCP server '{server}': {reason}")]
    InvalidResponse {
        /// Server name
        server: String,
        /// JSON-RPC method
        method: String,
        /// Deserialization failure
        reason: String,
    },

    /// No live connection exists for the resolved server
    #[error("MCP server '{0}' is not connected")]
    NotConnected(String),

    /// The server needs a per-session credential and none was usable
    #[error("MCP server '{0}' requires authentication")]
    AuthRequired(String),

    /// The connection was torn down while the request was outstanding
    #[error("Connection to MCP server '{0}' was closed")]
    ConnectionClosed(String),

    /// A qualified tool name could not be split into server and tool
    #[error("Invalid qualified tool name: '{0}'")]
    InvalidToolName(String),
}

impl BrokerError {
    /// Build a transport error
    pub fn transport(server: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// Map a JSON-RPC error returned by a tool call
    pub fn remote_tool(server: &str, tool: &str, error: RpcError) -> Self {
        Self::RemoteTool {
            server: server.to_string(),
            tool: tool.to_string(),
            code: error.code,
            message: error.message,
        }
    }

    /// Map a JSON-RPC error returned on the validated path
    pub fn rpc(server: &str, method: &str, error: RpcError) -> Self {
        Self::Rpc {
            server: server.to_string(),
            method: method.to_string(),
            code: error.code,
            message: error.message,
        }
    }

    /// Whether a caller may reasonably retry the operation
    ///
    /// Timeouts and transport failures are transient; configuration,
    /// authorization and remote tool errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::RequestTimeout { .. }
                | Self::Transport { .. }
                | Self::ConnectionClosed(_)
        )
    }
}

/// Result alias used across the connection layer
pub type BrokerResult<T> = Result<T, BrokerError>;
