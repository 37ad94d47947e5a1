//! MCP Connection
//!
//! A [`Connection`] owns one transport to one server, a monotonically
//! increasing request id counter and two correlation tables:
//!
//! - the **raw** table, used only by [`Connection::call_tool_raw`]. Replies
//!   are handed back untouched, so servers whose tool results do not match
//!   the nominal schema still work.
//! - the **validated client** table, used by listings, resource reads and
//!   prompt fetches. Replies are decoded into typed payloads and rejected
//!   when they do not fit.
//!
//! A single demultiplexer task reads every inbound message. A response whose
//! id is in the raw table resolves that entry; anything else goes to the
//! validated client. Notifications and server-initiated requests are logged
//! and dropped.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                     |
//!                     +--(timeout / transport error)--> Disconnected
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, TransportKind};
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::protocol::{
    GetPromptResult, InboundMessage, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, McpMethod, McpNotification, McpRequest, McpResponse,
    Prompt, ReadResourceResult, Resource, ServerInfo, Tool,
};
use crate::mcp::simulated::SimulationStore;
use crate::mcp::transport::{self, Transport};
use crate::metrics;

/// JSON-RPC code a server uses to reject credentials
const UNAUTHORIZED: i64 = -32001;

/// Upper bound on `nextCursor` pages followed by a listing
const MAX_LIST_PAGES: usize = 64;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Transport handshake in progress
    Connecting,
    /// Handshake complete, requests allowed
    Connected,
    /// Teardown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

type Outcome = BrokerResult<McpResponse>;

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Outcome>,
    started: Instant,
}

/// In-flight requests keyed by id
#[derive(Default)]
struct PendingTable {
    calls: Mutex<HashMap<u64, PendingCall>>,
}

impl PendingTable {
    fn register(&self, id: u64, method: &str) -> oneshot::Receiver<Outcome> {
        let (reply, rx) = oneshot::channel();
        self.lock().insert(
            id,
            PendingCall {
                method: method.to_string(),
                reply,
                started: Instant::now(),
            },
        );
        rx
    }

    /// Resolve the entry for this response, or hand the response back
    fn resolve(&self, response: McpResponse) -> Result<(), McpResponse> {
        let call = self.lock().remove(&response.id);
        match call {
            Some(call) => {
                tracing::trace!(
                    "Reply to {} #{} after {:?}",
                    call.method,
                    response.id,
                    call.started.elapsed()
                );
                // receiver may have timed out already
                let _ = call.reply.send(Ok(response));
                Ok(())
            }
            None => Err(response),
        }
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn reject_all(&self, server: &str) -> usize {
        let calls: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = calls.len();
        for call in calls {
            let _ = call
                .reply
                .send(Err(BrokerError::ConnectionClosed(server.to_string())));
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a pending entry when the waiting caller goes away
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// Route one inbound message
fn dispatch(server: &str, message: InboundMessage, raw: &PendingTable, client: &PendingTable) {
    match message {
        InboundMessage::Response(response) => {
            let Err(response) = raw.resolve(response) else {
                return;
            };
            if let Err(response) = client.resolve(response) {
                tracing::debug!(
                    "Dropping reply from MCP server '{}' with unknown id {}",
                    server,
                    response.id
                );
            }
        }
        InboundMessage::Notification { method, .. } => {
            tracing::debug!("Notification from MCP server '{}': {}", server, method);
        }
        InboundMessage::Request { id, method, .. } => {
            tracing::debug!(
                "Ignoring request {} '{}' from MCP server '{}'",
                id,
                method,
                server
            );
        }
    }
}

async fn demultiplex(
    server: String,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    raw: Arc<PendingTable>,
    client: Arc<PendingTable>,
) {
    while let Some(message) = inbound.recv().await {
        dispatch(&server, message, &raw, &client);
    }

    let rejected = raw.reject_all(&server) + client.reject_all(&server);
    if rejected > 0 {
        tracing::warn!(
            "Inbound stream from MCP server '{}' ended with {} request(s) outstanding",
            server,
            rejected
        );
    }
}

enum TransportSource {
    Build(SimulationStore),
    Fixed(Arc<dyn Transport>),
}

/// One logical connection to an MCP server
pub struct Connection {
    config: Arc<ServerConfig>,
    source: TransportSource,
    state: RwLock<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    next_id: AtomicU64,
    raw: Arc<PendingTable>,
    client: Arc<PendingTable>,
    demux: Mutex<Option<JoinHandle<()>>>,
    tools: RwLock<Vec<Tool>>,
    server_info: RwLock<Option<ServerInfo>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,
}

impl Connection {
    /// Create a disconnected connection; the transport is chosen from `config`
    pub fn new(config: ServerConfig, simulations: SimulationStore) -> Self {
        Self::with_source(config, TransportSource::Build(simulations))
    }

    /// Create a disconnected connection over a caller-supplied transport
    pub fn with_transport(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_source(config, TransportSource::Fixed(transport))
    }

    fn with_source(config: ServerConfig, source: TransportSource) -> Self {
        Self {
            config: Arc::new(config),
            source,
            state: RwLock::new(ConnectionState::Disconnected),
            transport: RwLock::new(None),
            next_id: AtomicU64::new(1),
            raw: Arc::new(PendingTable::default()),
            client: Arc::new(PendingTable::default()),
            demux: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            server_info: RwLock::new(None),
            connected_at: RwLock::new(None),
        }
    }

    /// Owning server name
    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    /// Configuration this connection was built from
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Connected and the transport still usable
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self
                .transport
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|transport| transport.is_connected())
                .unwrap_or(false)
    }

    /// Transport kind
    pub fn transport_kind(&self) -> TransportKind {
        self.config.kind()
    }

    /// Cached tool catalog
    pub fn tools(&self) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Server identity reported during the handshake
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// When the last successful handshake finished
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self
            .connected_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests awaiting a reply on either path
    pub fn pending_count(&self) -> usize {
        self.raw.len() + self.client.len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn make_transport(&self) -> Arc<dyn Transport> {
        match &self.source {
            TransportSource::Build(simulations) => transport::build(&self.config, simulations),
            TransportSource::Fixed(transport) => Arc::clone(transport),
        }
    }

    /// Connect, handshake and fetch the tool catalog
    ///
    /// The transport connect plus `initialize` exchange must finish within the
    /// configured timeout. Failure to list tools afterwards is logged and
    /// leaves an empty catalog, unless the connection was closed meanwhile,
    /// which fails with [`BrokerError::ConnectionClosed`].
    pub async fn connect(&self) -> BrokerResult<()> {
        let transport_alive = self
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|transport| transport.is_connected())
            .unwrap_or(false);

        let stale = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ConnectionState::Connected if transport_alive => return Ok(()),
                ConnectionState::Connected => {
                    *state = ConnectionState::Connecting;
                    true
                }
                ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    false
                }
                busy => {
                    return Err(BrokerError::transport(
                        &self.config.name,
                        format!("connection is {}", busy),
                    ))
                }
            }
        };

        // transport died underneath a connected session
        if stale {
            tracing::info!(
                "Transport to MCP server '{}' is gone; reconnecting",
                self.config.name
            );
            self.teardown().await;
        }

        tracing::info!(
            "Connecting to MCP server '{}' ({})",
            self.config.name,
            self.config.kind()
        );

        let transport = self.make_transport();
        let (sink, inbound) = mpsc::unbounded_channel();
        let demux = tokio::spawn(demultiplex(
            self.config.name.clone(),
            inbound,
            Arc::clone(&self.raw),
            Arc::clone(&self.client),
        ));
        *self.demux.lock().unwrap_or_else(PoisonError::into_inner) = Some(demux);
        *self.transport.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&transport));

        let handshake = async {
            transport.connect(sink).await?;
            self.handshake(&transport).await
        };

        let result = match tokio::time::timeout(self.config.timeout(), handshake).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(BrokerError::RequestTimeout { .. })) | Err(_) => {
                Err(BrokerError::ConnectionTimeout {
                    server: self.config.name.clone(),
                    timeout_ms: self.config.timeout_ms,
                })
            }
            Ok(Err(e)) => Err(e),
        };

        let info = match result {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Connecting to MCP server '{}' failed: {}", self.config.name, e);
                metrics::record_connect_failure(&self.config.name);
                self.teardown().await;
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        tracing::info!(
            "Connected to MCP server '{}' ({} {})",
            self.config.name,
            info.name,
            info.version
        );
        *self.server_info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
        *self
            .connected_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        self.set_state(ConnectionState::Connected);

        if let Err(e) = self.refresh_tools().await {
            tracing::warn!(
                "Failed to list tools for MCP server '{}': {}",
                self.config.name,
                e
            );
        }

        // a disconnect may have landed while tools were listed
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::ConnectionClosed(self.config.name.clone()));
        }
        Ok(())
    }

    async fn handshake(&self, transport: &Arc<dyn Transport>) -> BrokerResult<ServerInfo> {
        let params = serde_json::to_value(InitializeParams::for_this_client())
            .map_err(|e| BrokerError::transport(&self.config.name, e))?;

        let result: InitializeResult = match self
            .client_request(transport, McpMethod::Initialize.as_str(), Some(params))
            .await
        {
            Ok(result) => result,
            Err(BrokerError::Rpc { code, .. }) if code == UNAUTHORIZED => {
                return Err(BrokerError::AuthRequired(self.config.name.clone()))
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            "MCP server '{}' speaks protocol {}",
            self.config.name,
            result.protocol_version
        );

        transport
            .send(&McpNotification::new(McpMethod::Initialized.as_str(), None).into())
            .await?;

        Ok(result.server_info)
    }

    /// Disconnect and release the transport
    ///
    /// Every outstanding request on either path is rejected with
    /// [`BrokerError::ConnectionClosed`]. Teardown failures are logged, never
    /// returned.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnecting;
        }

        self.teardown().await;
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .connected_at
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(ConnectionState::Disconnected);

        tracing::info!("Disconnected from MCP server '{}'", self.config.name);
    }

    async fn teardown(&self) {
        let transport = self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let rejected = self.raw.reject_all(&self.config.name)
            + self.client.reject_all(&self.config.name);
        if rejected > 0 {
            tracing::debug!(
                "Rejected {} outstanding request(s) to MCP server '{}'",
                rejected,
                self.config.name
            );
        }

        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::warn!(
                    "Failed to close transport for MCP server '{}': {}",
                    self.config.name,
                    e
                );
            }
        }

        if let Some(demux) = self
            .demux
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            demux.abort();
        }
    }

    fn live_transport(&self) -> BrokerResult<Arc<dyn Transport>> {
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::NotConnected(self.config.name.clone()));
        }
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BrokerError::NotConnected(self.config.name.clone()))
    }

    async fn await_reply(
        &self,
        reply: oneshot::Receiver<Outcome>,
        method: &str,
    ) -> BrokerResult<McpResponse> {
        match tokio::time::timeout(self.config.timeout(), reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::ConnectionClosed(self.config.name.clone())),
            Err(_) => {
                tracing::warn!(
                    "Request '{}' to MCP server '{}' timed out after {}ms",
                    method,
                    self.config.name,
                    self.config.timeout_ms
                );
                metrics::record_request_timeout(&self.config.name, method);
                Err(BrokerError::RequestTimeout {
                    server: self.config.name.clone(),
                    method: method.to_string(),
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    /// Invoke a tool over the raw path
    ///
    /// The `result` member of the reply is returned as-is, without schema
    /// validation. An error reply becomes [`BrokerError::RemoteTool`].
    pub async fn call_tool_raw(&self, tool: &str, arguments: Value) -> BrokerResult<Value> {
        let transport = self.live_transport()?;
        let method = McpMethod::ToolsCall.as_str();

        let id = self.next_id();
        let reply = self.raw.register(id, method);
        let _guard = PendingGuard {
            table: &self.raw,
            id,
        };

        let request = McpRequest::new(
            id,
            method,
            Some(json!({"name": tool, "arguments": arguments})),
        );
        tracing::debug!("Calling tool '{}' on MCP server '{}' (#{})", tool, self.config.name, id);
        transport.send(&request.into()).await?;

        self.await_reply(reply, method)
            .await?
            .into_result()
            .map_err(|e| BrokerError::remote_tool(&self.config.name, tool, e))
    }

    async fn client_request<T: DeserializeOwned>(
        &self,
        transport: &Arc<dyn Transport>,
        method: &str,
        params: Option<Value>,
    ) -> BrokerResult<T> {
        let id = self.next_id();
        let reply = self.client.register(id, method);
        let _guard = PendingGuard {
            table: &self.client,
            id,
        };

        transport
            .send(&McpRequest::new(id, method, params).into())
            .await?;

        let value = self
            .await_reply(reply, method)
            .await?
            .into_result()
            .map_err(|e| BrokerError::rpc(&self.config.name, method, e))?;

        serde_json::from_value(value).map_err(|e| BrokerError::InvalidResponse {
            server: self.config.name.clone(),
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: McpMethod,
        params: Option<Value>,
    ) -> BrokerResult<T> {
        let transport = self.live_transport()?;
        self.client_request(&transport, method.as_str(), params).await
    }

    fn cursor_params(cursor: Option<&str>) -> Option<Value> {
        cursor.map(|cursor| json!({ "cursor": cursor }))
    }

    /// List every tool the server advertises, following pagination
    pub async fn list_tools(&self) -> BrokerResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: ListToolsResult = self
                .request(McpMethod::ToolsList, Self::cursor_params(cursor.as_deref()))
                .await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Re-list the tool catalog and cache it
    pub async fn refresh_tools(&self) -> BrokerResult<Vec<Tool>> {
        let tools = self.list_tools().await?;
        tracing::debug!(
            "MCP server '{}' advertises {} tool(s)",
            self.config.name,
            tools.len()
        );
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools.clone();
        Ok(tools)
    }

    /// List resources
    pub async fn list_resources(&self) -> BrokerResult<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: ListResourcesResult = self
                .request(McpMethod::ResourcesList, Self::cursor_params(cursor.as_deref()))
                .await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        Ok(resources)
    }

    /// Read one resource
    pub async fn read_resource(&self, uri: &str) -> BrokerResult<ReadResourceResult> {
        self.request(McpMethod::ResourcesRead, Some(json!({ "uri": uri })))
            .await
    }

    /// List prompts
    pub async fn list_prompts(&self) -> BrokerResult<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let page: ListPromptsResult = self
                .request(McpMethod::PromptsList, Self::cursor_params(cursor.as_deref()))
                .await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        Ok(prompts)
    }

    /// Render one prompt
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> BrokerResult<GetPromptResult> {
        self.request(
            McpMethod::PromptsGet,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.config.name)
            .field("kind", &self.config.kind())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(demux) = self
            .demux
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            demux.abort();
        }
    }
}
