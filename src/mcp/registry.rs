//! Connection Registry
//!
//! Holds at most one **shared** connection per server, usable by any caller,
//! and a two-level map of **session-scoped** connections
//! (session -> server -> connection) for servers that need a per-tenant
//! credential. Servers with `requires_auth` only ever live in the session
//! map; all other servers only in the shared map.
//!
//! Connect attempts for the same key are serialized by a per-key async
//! mutex. A caller that waited on the mutex and finds a live connection
//! created in the meantime reuses it instead of replacing it.
//!
//! Map locks are never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ServerConfig, TransportKind};
use crate::mcp::connection::{Connection, ConnectionState};
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::simulated::SimulationStore;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConnectKey {
    Shared(String),
    Session(String, String),
}

struct SessionEntry {
    connections: HashMap<String, Arc<Connection>>,
    last_active: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            last_active: Instant::now(),
        }
    }
}

/// Which map a status entry was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionScope {
    /// Shared connection
    Shared,
    /// Session-scoped connection
    Session,
}

/// Connectivity summary of one configured server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    /// Server name
    pub name: String,
    /// Description from the configuration
    pub description: String,
    /// Transport kind
    pub transport: TransportKind,
    /// Needs a session credential
    pub requires_auth: bool,
    /// A live connection exists for the caller
    pub connected: bool,
    /// Lifecycle state of that connection
    pub state: ConnectionState,
    /// Cached tool count
    pub tool_count: usize,
    /// Map the connection came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ConnectionScope>,
    /// Handshake completion time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// Shared and session-scoped connections
pub struct ConnectionRegistry {
    simulations: SimulationStore,
    shared: RwLock<HashMap<String, Arc<Connection>>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    connect_locks: Mutex<HashMap<ConnectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(simulations: SimulationStore) -> Self {
        Self {
            simulations,
            shared: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Simulation store handed to simulated transports
    pub fn simulations(&self) -> &SimulationStore {
        &self.simulations
    }

    fn connect_lock(&self, key: &ConnectKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .connect_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_lock(&self, key: &ConnectKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .connect_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // map entry plus ours: nobody else is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    /// Shared connection for `server`, live or not
    pub fn shared(&self, server: &str) -> Option<Arc<Connection>> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
    }

    /// Session connection for `server`; marks the session active
    pub fn session(&self, session_id: &str, server: &str) -> Option<Arc<Connection>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let entry = sessions.get_mut(session_id)?;
        entry.last_active = Instant::now();
        entry.connections.get(server).cloned()
    }

    /// Every shared connection
    pub fn shared_connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Every connection of one session
    pub fn session_connections(&self, session_id: &str) -> Vec<Arc<Connection>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.last_active = Instant::now();
                entry.connections.values().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of sessions holding at least one connection
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Replace the shared connection for `config.name` with a fresh one
    ///
    /// Any existing shared connection is torn down first. When another caller
    /// finished a connect while this one waited for the per-server lock, that
    /// connection is returned instead.
    pub async fn connect_shared(&self, config: &ServerConfig) -> BrokerResult<Arc<Connection>> {
        if config.requires_auth {
            return Err(BrokerError::AuthRequired(config.name.clone()));
        }

        let key = ConnectKey::Shared(config.name.clone());
        let before = self.shared(&config.name);
        let lock = self.connect_lock(&key);
        let result = {
            let _held = lock.lock().await;

            match self.shared(&config.name) {
                Some(current)
                    if current.is_connected()
                        && !before
                            .as_ref()
                            .map(|before| Arc::ptr_eq(before, &current))
                            .unwrap_or(false) =>
                {
                    tracing::debug!(
                        "Reusing shared connection to MCP server '{}' created concurrently",
                        config.name
                    );
                    Ok(current)
                }
                _ => self.replace_shared(config).await,
            }
        };
        self.release_lock(&key, lock);
        result
    }

    async fn replace_shared(&self, config: &ServerConfig) -> BrokerResult<Arc<Connection>> {
        self.disconnect_shared(&config.name).await;

        let connection = Arc::new(Connection::new(config.clone(), self.simulations.clone()));
        connection.connect().await?;

        let previous = self
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.name.clone(), Arc::clone(&connection));
        metrics::MCP_CONNECTIONS_ACTIVE.inc();

        if let Some(previous) = previous {
            metrics::MCP_CONNECTIONS_ACTIVE.dec();
            previous.disconnect().await;
        }
        Ok(connection)
    }

    /// Live session connection for `config.name`, connecting with `token` if needed
    ///
    /// The token only reaches the new connection's own transport
    /// configuration; the registry keeps no copy.
    pub async fn get_or_create_session_connection(
        &self,
        session_id: &str,
        config: &ServerConfig,
        token: &str,
    ) -> BrokerResult<Arc<Connection>> {
        if !config.requires_auth {
            return Err(BrokerError::InvalidConfig(format!(
                "MCP server '{}' does not use session connections",
                config.name
            )));
        }
        if token.is_empty() {
            return Err(BrokerError::AuthRequired(config.name.clone()));
        }

        if let Some(connection) = self.session(session_id, &config.name) {
            if connection.is_connected() {
                return Ok(connection);
            }
        }

        let key = ConnectKey::Session(session_id.to_string(), config.name.clone());
        let lock = self.connect_lock(&key);
        let result = {
            let _held = lock.lock().await;

            match self.session(session_id, &config.name) {
                Some(connection) if connection.is_connected() => Ok(connection),
                _ => self.create_session_connection(session_id, config, token).await,
            }
        };
        self.release_lock(&key, lock);
        result
    }

    async fn create_session_connection(
        &self,
        session_id: &str,
        config: &ServerConfig,
        token: &str,
    ) -> BrokerResult<Arc<Connection>> {
        self.disconnect_session(session_id, &config.name).await;

        tracing::info!(
            "Opening session connection to MCP server '{}' for session '{}'",
            config.name,
            session_id
        );
        let connection = Arc::new(Connection::new(
            config.with_auth_token(token),
            self.simulations.clone(),
        ));
        connection.connect().await?;

        let previous = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let entry = sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);
            entry.last_active = Instant::now();
            entry
                .connections
                .insert(config.name.clone(), Arc::clone(&connection))
        };
        metrics::MCP_SESSION_CONNECTIONS_ACTIVE.inc();

        if let Some(previous) = previous {
            metrics::MCP_SESSION_CONNECTIONS_ACTIVE.dec();
            previous.disconnect().await;
        }
        Ok(connection)
    }

    /// Tear down the shared connection; returns whether one existed
    pub async fn disconnect_shared(&self, server: &str) -> bool {
        let removed = self
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server);
        match removed {
            Some(connection) => {
                metrics::MCP_CONNECTIONS_ACTIVE.dec();
                connection.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Tear down one session connection; returns whether one existed
    pub async fn disconnect_session(&self, session_id: &str, server: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions
                .get_mut(session_id)
                .and_then(|entry| entry.connections.remove(server));
            if sessions
                .get(session_id)
                .map(|entry| entry.connections.is_empty())
                .unwrap_or(false)
            {
                sessions.remove(session_id);
            }
            removed
        };
        match removed {
            Some(connection) => {
                metrics::MCP_SESSION_CONNECTIONS_ACTIVE.dec();
                connection.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every connection of a session; returns how many were closed
    pub async fn disconnect_user_session(&self, session_id: &str) -> usize {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        match removed {
            Some(entry) => Self::disconnect_session_entry(entry).await,
            None => 0,
        }
    }

    async fn disconnect_session_entry(entry: SessionEntry) -> usize {
        let count = entry.connections.len();
        for connection in entry.connections.into_values() {
            metrics::MCP_SESSION_CONNECTIONS_ACTIVE.dec();
            connection.disconnect().await;
        }
        count
    }

    /// Tear down the shared and every session connection to `server`
    pub async fn disconnect_server_everywhere(&self, server: &str) -> usize {
        let mut closed = usize::from(self.disconnect_shared(server).await);

        let removed: Vec<Arc<Connection>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions
                .values_mut()
                .filter_map(|entry| entry.connections.remove(server))
                .collect();
            sessions.retain(|_, entry| !entry.connections.is_empty());
            removed
        };
        for connection in removed {
            metrics::MCP_SESSION_CONNECTIONS_ACTIVE.dec();
            connection.disconnect().await;
            closed += 1;
        }
        closed
    }

    /// Disconnect sessions untouched for at least `max_idle`
    ///
    /// Returns the number of sessions removed.
    pub async fn sweep_idle_sessions(&self, max_idle: Duration) -> usize {
        let idle: Vec<(String, SessionEntry)> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.last_active.elapsed() >= max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let swept = idle.len();
        for (session_id, entry) in idle {
            let closed = Self::disconnect_session_entry(entry).await;
            tracing::info!(
                "Session '{}' idle for {:?}; closed {} connection(s)",
                session_id,
                max_idle,
                closed
            );
        }
        swept
    }

    /// Tear down everything
    pub async fn disconnect_all(&self) {
        let shared: Vec<Arc<Connection>> = self
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in shared {
            metrics::MCP_CONNECTIONS_ACTIVE.dec();
            connection.disconnect().await;
        }

        let sessions: Vec<SessionEntry> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in sessions {
            Self::disconnect_session_entry(entry).await;
        }
    }

    /// Status of every configured server as seen by `session_id`
    pub fn status(&self, configs: &[ServerConfig], session_id: Option<&str>) -> Vec<ServerStatus> {
        configs
            .iter()
            .map(|config| {
                let found = if config.requires_auth {
                    session_id
                        .and_then(|session_id| self.session(session_id, &config.name))
                        .map(|connection| (connection, ConnectionScope::Session))
                } else {
                    self.shared(&config.name)
                        .map(|connection| (connection, ConnectionScope::Shared))
                };

                match found {
                    Some((connection, scope)) => ServerStatus {
                        name: config.name.clone(),
                        description: config.description.clone(),
                        transport: config.kind(),
                        requires_auth: config.requires_auth,
                        connected: connection.is_connected(),
                        state: connection.state(),
                        tool_count: connection.tools().len(),
                        scope: Some(scope),
                        connected_at: connection.connected_at(),
                    },
                    None => ServerStatus {
                        name: config.name.clone(),
                        description: config.description.clone(),
                        transport: config.kind(),
                        requires_auth: config.requires_auth,
                        connected: false,
                        state: ConnectionState::Disconnected,
                        tool_count: 0,
                        scope: None,
                        connected_at: None,
                    },
                }
            })
            .collect()
    }
}
