//! MCP Transport Layer
//!
//! This module defines the transport abstraction for communicating with MCP servers.
//! Three transports are supported:
//!
//! - **stdio**: child process, one JSON message per line on stdin/stdout
//! - **sse**: HTTP event stream plus POST endpoint (see [`crate::mcp::http_transport`])
//! - **simulated**: in-process canned server (see [`crate::mcp::simulated`])
//!
//! # Architecture
//!
//! The transport layer is responsible only for moving messages. Every inbound
//! message is parsed leniently and pushed into an [`InboundSink`]; the
//! connection's demultiplexer owns correlation. Transport selection happens
//! once, in [`build`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, TransportConfig, TransportKind};
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::http_transport::SseTransport;
use crate::mcp::protocol::{InboundMessage, OutboundMessage};
use crate::mcp::simulated::{SimulatedTransport, SimulationStore};

/// Channel a transport pushes parsed inbound messages into
pub type InboundSink = mpsc::UnboundedSender<InboundMessage>;

/// Transport trait for MCP communication
///
/// All transports implement this trait so the connection can drive any of
/// them through an `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying channel and start delivering inbound messages
    async fn connect(&self, inbound: InboundSink) -> BrokerResult<()>;

    /// Send one message to the server
    async fn send(&self, message: &OutboundMessage) -> BrokerResult<()>;

    /// Close the channel; idempotent
    async fn close(&self) -> BrokerResult<()>;

    /// Whether the channel is still usable
    fn is_connected(&self) -> bool;

    /// Transport kind
    fn kind(&self) -> TransportKind;
}

/// Build the transport for a server configuration
pub fn build(config: &ServerConfig, simulations: &SimulationStore) -> Arc<dyn Transport> {
    match &config.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Arc::new(StdioTransport::new(
            &config.name,
            StdioCommand {
                command: command.clone(),
                args: args.clone(),
                env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                cwd: cwd.clone(),
            },
        )),
        TransportConfig::Sse { url, headers } => {
            Arc::new(SseTransport::new(&config.name, url, headers.clone()))
        }
        TransportConfig::Simulated {
            simulation_id,
            credential,
        } => Arc::new(SimulatedTransport::new(
            &config.name,
            simulation_id,
            credential.clone(),
            simulations.clone(),
        )),
    }
}

/// Process description for a stdio server
#[derive(Debug, Clone, Default)]
pub struct StdioCommand {
    /// Executable
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: Option<String>,
}

impl StdioCommand {
    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// stdio transport for local MCP servers
///
/// This transport spawns an MCP server as a child process and communicates
/// with it via stdin/stdout. Each line is a JSON-RPC message. A reader task
/// forwards parsed lines to the inbound sink; stderr is drained to the log.
///
/// # Example
///
/// ```ignore
/// let transport = StdioTransport::new("files", StdioCommand {
///     command: "npx".into(),
///     args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into()],
///     ..Default::default()
/// });
/// transport.connect(sink).await?;
/// ```
pub struct StdioTransport {
    server: String,
    spec: StdioCommand,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Create an unconnected transport
    pub fn new(server: &str, spec: StdioCommand) -> Self {
        Self {
            server: server.to_string(),
            spec,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the server command string (for diagnostics)
    pub fn command(&self) -> String {
        self.spec.display()
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self, inbound: InboundSink) -> BrokerResult<()> {
        tracing::info!("Spawning MCP server '{}': {}", self.server, self.spec.command);
        tracing::debug!("Server arguments: {:?}", self.spec.args);

        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            BrokerError::transport(
                &self.server,
                format!("failed to spawn '{}': {}", self.spec.display(), e),
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::transport(&self.server, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::transport(&self.server, "child stdout unavailable"))?;
        let stderr = child.stderr.take();
        self.connected.store(true, Ordering::SeqCst);

        let server = self.server.clone();
        let connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::trace!("Received from MCP server '{}': {}", server, line);
                        match InboundMessage::parse_str(line) {
                            Some(message) => {
                                if inbound.send(message).is_err() {
                                    break;
                                }
                            }
                            None => tracing::debug!(
                                "Ignoring non-JSON-RPC line from MCP server '{}': {}",
                                server,
                                line
                            ),
                        }
                    }
                    Ok(None) => {
                        tracing::info!("MCP server '{}' closed stdout (EOF)", server);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read from MCP server '{}': {}", server, e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        let mut tasks = vec![reader];
        if let Some(stderr) = stderr {
            let server = self.server.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{} stderr] {}", server, line);
                }
            }));
        }

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        if let Ok(mut slot) = self.tasks.lock() {
            slot.extend(tasks);
        }
        Ok(())
    }

    /// Send a JSON-RPC message to the MCP server via stdin
    ///
    /// The message is serialized to JSON and written as a single line.
    async fn send(&self, message: &OutboundMessage) -> BrokerResult<()> {
        if !self.is_connected() {
            return Err(BrokerError::transport(&self.server, "transport is not connected"));
        }

        let json = message
            .to_json()
            .map_err(|e| BrokerError::transport(&self.server, e))?;
        tracing::trace!("Sending to MCP server '{}': {}", self.server, json);

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BrokerError::transport(&self.server, "stdin closed"))?;

        let write = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            BrokerError::transport(&self.server, format!("failed to write to stdin: {}", e))
        })
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.stdin.lock().await.take();
        self.abort_tasks();

        if let Some(mut child) = self.child.lock().await.take() {
            tracing::info!("Killing MCP server '{}': {}", self.server, self.spec.command);
            if let Err(e) = child.kill().await {
                tracing::debug!("Kill of MCP server '{}' failed: {}", self.server, e);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.abort_tasks();
        // Can't await in Drop, so just start the kill
        if let Some(mut child) = self.child.get_mut().take() {
            tracing::debug!("Dropping StdioTransport, killing MCP server '{}'", self.server);
            let _ = child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::McpRequest;
    use std::time::Duration;

    // Helper to create a test script
    fn setup_test_script(name: &str, content: &str) -> tempfile::TempPath {
        let file = tempfile::Builder::new()
            .prefix(name)
            .suffix(".sh")
            .tempfile()
            .unwrap();
        std::fs::write(file.path(), content).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        file.into_temp_path()
    }

    fn command_for(path: &std::path::Path) -> StdioCommand {
        StdioCommand {
            command: path.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let transport = StdioTransport::new(
            "missing",
            StdioCommand {
                command: "/definitely/not/a/real/binary".to_string(),
                ..Default::default()
            },
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = transport.connect(tx).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let transport = StdioTransport::new("idle", StdioCommand::default());
        let message = OutboundMessage::from(McpRequest::new(1, "tools/list", None));

        let err = transport.send(&message).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_round_trip() {
        // Echoes a response with the id of every request it reads
        let script = setup_test_script(
            "mcp_echo",
            r#"#!/bin/sh
while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
    echo "not json, ignored"
    printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":true}}\n' "$id"
done
"#,
        );

        let transport = StdioTransport::new("echo", command_for(&script));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        assert!(transport.is_connected());

        transport
            .send(&McpRequest::new(7, "tools/list", None).into())
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.response_id(), Some(7));

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        // idempotent
        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_is_passed_to_child() {
        let script = setup_test_script(
            "mcp_env",
            r#"#!/bin/sh
read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"token":"%s"}}\n' "$MCP_AUTH_TOKEN"
"#,
        );

        let mut spec = command_for(&script);
        spec.env.push(("MCP_AUTH_TOKEN".to_string(), "secret".to_string()));
        let transport = StdioTransport::new("env", spec);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        transport
            .send(&McpRequest::new(1, "tools/list", None).into())
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            InboundMessage::Response(response) => {
                assert_eq!(response.result.unwrap()["token"], "secret");
            }
            other => panic!("unexpected {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_eof_marks_disconnected() {
        let script = setup_test_script("mcp_exit", "#!/bin/sh\nexit 0\n");

        let transport = StdioTransport::new("exit", command_for(&script));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        // sink is dropped by the reader once stdout hits EOF
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_transport_trait_bounds() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StdioTransport>();
    }

    #[test]
    fn test_command_display() {
        let transport = StdioTransport::new(
            "files",
            StdioCommand {
                command: "npx".to_string(),
                args: vec!["-y".to_string(), "server".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(transport.command(), "npx -y server");
    }
}
