// Configuration File Support
//
// This module provides configuration parsing for the MCP broker.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from the user config directory:
// ~/.config/mcp-broker/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mcp::catalog::QUALIFIED_NAME_SEPARATOR;
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::simulated::{SimulatedServer, SimulationStore};

/// Default per-request and handshake timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Environment variable a session token is injected into for pipe transports
pub const DEFAULT_AUTH_ENV_VAR: &str = "MCP_AUTH_TOKEN";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Session-scoped connection housekeeping
    pub sessions: SessionConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// MCP server configurations, keyed by server name
    pub mcp_servers: BTreeMap<String, ServerConfig>,

    /// Canned server definitions backing simulated transports
    pub simulations: BTreeMap<String, SimulatedServer>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Session housekeeping configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions untouched for this long are disconnected
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve the metrics endpoint
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Transport kind of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process over stdin/stdout
    Stdio,
    /// Long-lived HTTP event stream
    Sse,
    /// In-process simulation
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

/// Transport parameters, one variant per transport kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a child process and talk over its standard streams
    #[serde(alias = "pipe")]
    Stdio {
        /// Executable to spawn
        command: String,
        /// Arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// Open an HTTP event stream
    #[serde(alias = "stream", alias = "http")]
    Sse {
        /// Event stream URL
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    /// Serve canned definitions from the in-process simulation store
    Simulated {
        /// Key into the simulation store
        simulation_id: String,
        /// Session credential injected at connect time
        #[serde(skip)]
        credential: Option<String>,
    },
}

impl TransportConfig {
    /// The kind of this transport
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::Simulated { .. } => TransportKind::Simulated,
        }
    }
}

/// MCP server configuration
///
/// Immutable once handed to the manager; updates replace the whole value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Unique server name (filled from the table key when loaded from a file)
    #[serde(default)]
    pub name: String,

    /// Transport kind and parameters
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Human description
    #[serde(default)]
    pub description: String,

    /// Whether the server needs a per-session credential
    #[serde(default)]
    pub requires_auth: bool,

    /// Handshake and per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Auto-connect on boot
    #[serde(default = "default_startup")]
    pub startup: bool,

    /// Environment variable that receives a session token (pipe transport)
    #[serde(default = "default_auth_env_var")]
    pub auth_env_var: String,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_startup() -> bool {
    true
}

fn default_auth_env_var() -> String {
    DEFAULT_AUTH_ENV_VAR.to_string()
}

impl ServerConfig {
    /// Create a configuration with default flags
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            description: String::new(),
            requires_auth: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            startup: true,
            auth_env_var: default_auth_env_var(),
        }
    }

    /// Child-process server
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self::new(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                cwd: None,
            },
        )
    }

    /// HTTP event-stream server
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportConfig::Sse {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        )
    }

    /// Simulated server backed by the simulation store
    pub fn simulated(name: impl Into<String>, simulation_id: impl Into<String>) -> Self {
        Self::new(
            name,
            TransportConfig::Simulated {
                simulation_id: simulation_id.into(),
                credential: None,
            },
        )
    }

    /// Set the `requires_auth` flag
    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the `startup` flag
    pub fn with_startup(mut self, startup: bool) -> Self {
        self.startup = startup;
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Request timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Transport kind
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Copy of this configuration carrying a session credential
    ///
    /// Pipe transports receive the token in `auth_env_var`, stream transports
    /// as a bearer `Authorization` header. The original value is untouched,
    /// so the token lives only in the connection built from the copy.
    pub fn with_auth_token(&self, token: &str) -> Self {
        let mut config = self.clone();
        match &mut config.transport {
            TransportConfig::Stdio { env, .. } => {
                env.insert(self.auth_env_var.clone(), token.to_string());
            }
            TransportConfig::Sse { headers, .. } => {
                headers.insert("Authorization".to_string(), format!("Bearer {}", token));
            }
            TransportConfig::Simulated { credential, .. } => {
                *credential = Some(token.to_string());
            }
        }
        config
    }

    /// The session credential injected by [`ServerConfig::with_auth_token`], if any
    pub fn credential(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Stdio { env, .. } => env.get(&self.auth_env_var).map(String::as_str),
            TransportConfig::Sse { headers, .. } => headers
                .get("Authorization")
                .and_then(|value| value.strip_prefix("Bearer ")),
            TransportConfig::Simulated { credential, .. } => credential.as_deref(),
        }
    }

    /// Validate this configuration
    pub fn validate(&self) -> BrokerResult<()> {
        validate_server_name(&self.name)?;

        if self.timeout_ms == 0 {
            return Err(BrokerError::InvalidConfig(format!(
                "MCP server '{}' has a zero timeout",
                self.name
            )));
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                Err(BrokerError::InvalidConfig(format!(
                    "MCP server '{}' has empty command",
                    self.name
                )))
            }
            TransportConfig::Sse { url, .. } => reqwest::Url::parse(url).map(|_| ()).map_err(|e| {
                BrokerError::InvalidConfig(format!(
                    "MCP server '{}' has invalid URL '{}': {}",
                    self.name, url, e
                ))
            }),
            TransportConfig::Simulated { simulation_id, .. } if simulation_id.is_empty() => {
                Err(BrokerError::InvalidConfig(format!(
                    "MCP server '{}' has empty simulation_id",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Reject names that cannot round-trip through a qualified tool name
pub fn validate_server_name(name: &str) -> BrokerResult<()> {
    if name.trim().is_empty() {
        return Err(BrokerError::InvalidConfig(
            "MCP server name must not be empty".to_string(),
        ));
    }
    if name.contains(QUALIFIED_NAME_SEPARATOR) {
        return Err(BrokerError::InvalidConfig(format!(
            "MCP server name '{}' must not contain '{}'",
            name, QUALIFIED_NAME_SEPARATOR
        )));
    }
    // a trailing '_' would merge into the separator
    if name.ends_with('_') {
        return Err(BrokerError::InvalidConfig(format!(
            "MCP server name '{}' must not end with '_'",
            name
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from the default config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to load config file from {:?}", path))?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse, apply environment overrides and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse TOML")?;

        for (name, server) in config.mcp_servers.iter_mut() {
            server.name = name.clone();
        }

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/mcp-broker/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("mcp-broker").join("config.toml"),
            None => PathBuf::from("mcp-broker.toml"),
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - MCP_BROKER_LOG_LEVEL
    /// - MCP_BROKER_LOG_FORMAT
    /// - MCP_BROKER_SESSION_IDLE_SECS
    /// - MCP_BROKER_METRICS_ENABLED
    /// - MCP_BROKER_METRICS_PORT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("MCP_BROKER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MCP_BROKER_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(idle) = std::env::var("MCP_BROKER_SESSION_IDLE_SECS") {
            if let Ok(idle) = idle.parse::<u64>() {
                if idle > 0 {
                    self.sessions.idle_timeout_secs = idle;
                }
            }
        }

        if let Ok(enabled) = std::env::var("MCP_BROKER_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("MCP_BROKER_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.sessions.idle_timeout_secs == 0 {
            anyhow::bail!("Session idle timeout must be > 0");
        }
        if self.sessions.sweep_interval_secs == 0 {
            anyhow::bail!("Session sweep interval must be > 0");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        for (id, simulation) in &self.simulations {
            if !(0.0..=1.0).contains(&simulation.error_rate) {
                anyhow::bail!(
                    "Simulation '{}' has error_rate {} outside 0.0..=1.0",
                    id,
                    simulation.error_rate
                );
            }
        }

        for server in self.mcp_servers.values() {
            server.validate()?;
            if let TransportConfig::Simulated { simulation_id, .. } = &server.transport {
                if !self.simulations.contains_key(simulation_id) {
                    anyhow::bail!(
                        "MCP server '{}' references unknown simulation '{}'",
                        server.name,
                        simulation_id
                    );
                }
            }
        }

        Ok(())
    }

    /// Server configurations in name order
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.mcp_servers.values().cloned().collect()
    }

    /// Build the simulation store described by `[simulations]`
    pub fn simulation_store(&self) -> SimulationStore {
        let store = SimulationStore::new();
        for (id, simulation) in &self.simulations {
            store.insert(id.clone(), simulation.clone());
        }
        store
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
