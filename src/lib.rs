//! MCP Broker Library
//!
//! Connects to Model Context Protocol servers over stdio, SSE or an
//! in-process simulation, aggregates their tools into one catalog and
//! routes tool calls, with per-session connections for servers that need
//! a user credential.

pub mod config;
pub mod mcp;
pub mod metrics;
pub mod metrics_server;

pub use config::{Config, ServerConfig, TransportConfig};
pub use mcp::{BrokerError, BrokerResult, McpManager};
