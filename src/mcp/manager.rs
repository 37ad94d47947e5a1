//! MCP Manager
//!
//! The broker's outward surface: server configuration, connection lifecycle,
//! catalog, tool invocation, resources, prompts and status. One manager is
//! built at startup and shared by `Arc` with everything that needs it.
//!
//! # Example
//!
//! ```ignore
//! let manager = Arc::new(McpManager::from_config(&config));
//! manager.initialize(config.server_configs()).await;
//!
//! let tools = manager.get_tools_for_llm(Some("session-1"));
//! let result = manager
//!     .call_tool_by_full_name("echo__ping", json!({}), Some("session-1"), None)
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::{validate_server_name, Config, ServerConfig};
use crate::mcp::catalog::{self, CatalogTool};
use crate::mcp::connection::Connection;
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::protocol::{GetPromptResult, Prompt, ReadResourceResult, Resource};
use crate::mcp::registry::{ConnectionRegistry, ServerStatus};
use crate::mcp::router;
use crate::mcp::simulated::SimulationStore;

/// Connection and tool-invocation broker
pub struct McpManager {
    configs: RwLock<BTreeMap<String, ServerConfig>>,
    registry: ConnectionRegistry,
}

impl McpManager {
    /// Create a manager with no servers
    pub fn new(simulations: SimulationStore) -> Self {
        Self {
            configs: RwLock::new(BTreeMap::new()),
            registry: ConnectionRegistry::new(simulations),
        }
    }

    /// Create a manager using the simulations of a loaded configuration
    ///
    /// Servers are not added; pass `config.server_configs()` to
    /// [`McpManager::initialize`].
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.simulation_store())
    }

    /// Underlying connection registry
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Simulation store used by simulated servers
    pub fn simulations(&self) -> &SimulationStore {
        self.registry.simulations()
    }

    /// Every server configuration, in name order
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Configuration of one server
    pub fn server_config(&self, name: &str) -> BrokerResult<ServerConfig> {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ConfigNotFound(name.to_string()))
    }

    /// Load configurations and connect the startup servers
    ///
    /// Servers with `startup` set and without `requires_auth` are connected
    /// concurrently. Invalid configurations and failed connects are returned
    /// by server name; they never abort the rest.
    pub async fn initialize(&self, configs: Vec<ServerConfig>) -> Vec<(String, BrokerError)> {
        let mut failures = Vec::new();
        let mut startup = Vec::new();

        for config in configs {
            if let Err(e) = config.validate() {
                tracing::error!("Skipping MCP server '{}': {}", config.name, e);
                failures.push((config.name.clone(), e));
                continue;
            }
            if config.startup && !config.requires_auth {
                startup.push(config.clone());
            }
            self.configs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(config.name.clone(), config);
        }

        tracing::info!(
            "Loaded {} MCP server configuration(s); connecting {} at startup",
            self.configs.read().unwrap_or_else(PoisonError::into_inner).len(),
            startup.len()
        );

        let attempts = startup.iter().map(|config| async move {
            (config.name.clone(), self.registry.connect_shared(config).await)
        });
        for (name, result) in futures::future::join_all(attempts).await {
            if let Err(e) = result {
                tracing::error!("Failed to connect MCP server '{}': {}", name, e);
                failures.push((name, e));
            }
        }

        failures
    }

    /// Add or replace a server configuration
    ///
    /// Replacing a configuration tears down every connection built from the
    /// previous one. Nothing is connected automatically.
    pub async fn add_server_config(
        &self,
        name: &str,
        mut config: ServerConfig,
    ) -> BrokerResult<()> {
        validate_server_name(name)?;
        config.name = name.to_string();
        config.validate()?;

        let replaced = self
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), config)
            .is_some();

        if replaced {
            let closed = self.registry.disconnect_server_everywhere(name).await;
            tracing::info!(
                "Replaced configuration of MCP server '{}' ({} connection(s) closed)",
                name,
                closed
            );
        } else {
            tracing::info!("Added MCP server '{}'", name);
        }
        Ok(())
    }

    /// Disconnect every connection to a server, then forget its configuration
    pub async fn remove_server_config(&self, name: &str) -> BrokerResult<()> {
        self.server_config(name)?;

        let closed = self.registry.disconnect_server_everywhere(name).await;
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        tracing::info!("Removed MCP server '{}' ({} connection(s) closed)", name, closed);
        Ok(())
    }

    /// (Re)connect the shared connection of a server
    pub async fn connect_server(&self, name: &str) -> BrokerResult<Arc<Connection>> {
        let config = self.server_config(name)?;
        self.registry.connect_shared(&config).await
    }

    /// Disconnect the shared connection of a server
    pub async fn disconnect_server(&self, name: &str) -> BrokerResult<()> {
        self.server_config(name)?;
        self.registry.disconnect_shared(name).await;
        Ok(())
    }

    /// Connection a session should use for a server
    ///
    /// For `requires_auth` servers this opens (or reuses) the session's own
    /// connection with `token`; other servers resolve to the shared one.
    pub async fn get_user_connection(
        &self,
        session_id: &str,
        name: &str,
        token: &str,
    ) -> BrokerResult<Arc<Connection>> {
        let config = self.server_config(name)?;
        if config.requires_auth {
            self.registry
                .get_or_create_session_connection(session_id, &config, token)
                .await
        } else {
            router::resolve_connection(&self.registry, &config, Some(session_id), None).await
        }
    }

    /// Disconnect one session connection; returns whether one existed
    pub async fn disconnect_user_server(&self, session_id: &str, name: &str) -> bool {
        self.registry.disconnect_session(session_id, name).await
    }

    /// Disconnect every connection of a session; returns how many were closed
    pub async fn disconnect_user_session(&self, session_id: &str) -> usize {
        self.registry.disconnect_user_session(session_id).await
    }

    /// Aggregated catalog as seen by `session_id`
    pub fn get_all_tools(&self, session_id: Option<&str>) -> Vec<CatalogTool> {
        let configs = self.server_configs();
        let shared = self.registry.shared_connections();
        let session = session_id
            .map(|session_id| self.registry.session_connections(session_id))
            .unwrap_or_default();
        catalog::aggregate(&configs, &shared, &session)
    }

    /// Catalog in function-calling shape with simplified schemas
    pub fn get_tools_for_llm(&self, session_id: Option<&str>) -> Vec<Value> {
        catalog::llm_tools(&self.get_all_tools(session_id))
    }

    /// Call a tool by server and tool name
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        session_id: Option<&str>,
    ) -> BrokerResult<Value> {
        let config = self.server_config(server)?;
        router::invoke(&self.registry, &config, tool, arguments, session_id, None).await
    }

    /// Call a tool by qualified name, optionally on behalf of a user
    ///
    /// `token` is merged into the arguments for the remote tool and, for
    /// `requires_auth` servers, used to open the session connection when
    /// none exists yet.
    pub async fn call_tool_by_full_name(
        &self,
        qualified_name: &str,
        arguments: Value,
        session_id: Option<&str>,
        token: Option<&str>,
    ) -> BrokerResult<Value> {
        let (server, tool) = catalog::resolve(qualified_name)?;
        let config = self.server_config(server)?;
        router::invoke(&self.registry, &config, tool, arguments, session_id, token).await
    }

    async fn connection_for(
        &self,
        server: &str,
        session_id: Option<&str>,
    ) -> BrokerResult<Arc<Connection>> {
        let config = self.server_config(server)?;
        router::resolve_connection(&self.registry, &config, session_id, None).await
    }

    /// List the resources of a server
    pub async fn list_resources(
        &self,
        server: &str,
        session_id: Option<&str>,
    ) -> BrokerResult<Vec<Resource>> {
        self.connection_for(server, session_id)
            .await?
            .list_resources()
            .await
    }

    /// Read one resource
    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
        session_id: Option<&str>,
    ) -> BrokerResult<ReadResourceResult> {
        self.connection_for(server, session_id)
            .await?
            .read_resource(uri)
            .await
    }

    /// List the prompts of a server
    pub async fn list_prompts(
        &self,
        server: &str,
        session_id: Option<&str>,
    ) -> BrokerResult<Vec<Prompt>> {
        self.connection_for(server, session_id)
            .await?
            .list_prompts()
            .await
    }

    /// Render one prompt
    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Value,
        session_id: Option<&str>,
    ) -> BrokerResult<GetPromptResult> {
        self.connection_for(server, session_id)
            .await?
            .get_prompt(name, arguments)
            .await
    }

    /// Connectivity of every configured server as seen by `session_id`
    pub fn get_status(&self, session_id: Option<&str>) -> Vec<ServerStatus> {
        self.registry.status(&self.server_configs(), session_id)
    }

    /// Disconnect sessions idle for at least `max_idle`
    pub async fn sweep_idle_sessions(&self, max_idle: Duration) -> usize {
        self.registry.sweep_idle_sessions(max_idle).await
    }

    /// Run [`McpManager::sweep_idle_sessions`] every `interval`
    ///
    /// The task stops once the manager is dropped.
    pub fn spawn_session_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let swept = manager.sweep_idle_sessions(max_idle).await;
                if swept > 0 {
                    tracing::info!("Swept {} idle session(s)", swept);
                }
            }
        })
    }

    /// Disconnect everything; used at shutdown
    pub async fn disconnect_all(&self) {
        self.registry.disconnect_all().await;
        tracing::info!("Disconnected all MCP servers");
    }
}
