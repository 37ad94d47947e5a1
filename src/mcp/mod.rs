//! MCP (Model Context Protocol) connection broker
//!
//! Tool-using agents reach many MCP servers through one place: this module
//! connects to them, aggregates their tools into a single namespaced
//! catalog and routes calls to the right connection, including
//! per-session connections for servers that need a user credential.
//!
//! # Architecture
//!
//! 1. **Protocol Layer** (`protocol`): JSON-RPC 2.0 message types
//! 2. **Transport Layer** (`transport`, `http_transport`, `simulated`):
//!    stdio, SSE and in-process simulated servers
//! 3. **Connection Layer** (`connection`): handshake, request/response
//!    correlation, timeouts
//! 4. **Broker Layer** (`registry`, `catalog`, `router`, `manager`):
//!    shared and session connections, tool catalog, invocation routing

// Protocol layer: JSON-RPC 2.0 message types
pub mod protocol;

// Broker error type
pub mod error;

// Transport layer: stdio transport and the Transport trait
pub mod transport;

// SSE transport for remote MCP servers
pub mod http_transport;

// Simulated MCP servers
pub mod simulated;

// One logical session with one MCP server
pub mod connection;

// Shared and per-session connections
pub mod registry;

// Tool schema simplification
pub mod schema;

// Namespaced tool catalog
pub mod catalog;

// Tool call routing
pub mod router;

// Broker facade
pub mod manager;

// Retry logic and error resilience
pub mod retry;

pub use catalog::{qualify, resolve, CatalogTool, QUALIFIED_NAME_SEPARATOR};
pub use connection::{Connection, ConnectionState};
pub use error::{BrokerError, BrokerResult};
pub use http_transport::SseTransport;
pub use manager::McpManager;
pub use protocol::{
    InboundMessage, McpMethod, McpRequest, McpResponse, OutboundMessage, RpcError, ServerInfo,
    Tool,
};
pub use registry::{ConnectionRegistry, ConnectionScope, ServerStatus};
pub use simulated::{SimulatedServer, SimulatedTool, SimulationStore};
pub use transport::{StdioTransport, Transport};

// Property-based tests module
#[cfg(test)]
mod proptests;
