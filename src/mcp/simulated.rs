//! Simulated MCP Servers
//!
//! An in-process transport that answers protocol requests from canned
//! definitions held in a [`SimulationStore`]. No process or socket is
//! involved, so routing and catalog code treats simulated servers exactly
//! like real ones.
//!
//! Each request is answered on its own task after the configured delay, so
//! tools with different delays reply out of order, the same way a real
//! server handling concurrent calls would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::TransportKind;
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::protocol::{
    GetPromptResult, InboundMessage, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, McpMethod, McpRequest, McpResponse, OutboundMessage, Prompt, PromptArgument,
    PromptMessage, ReadResourceResult, Resource, ResourceContents, RpcError, ServerInfo, Tool,
    MCP_PROTOCOL_VERSION,
};
use crate::mcp::transport::{InboundSink, Transport};

/// JSON-RPC code for an unknown resource URI
const RESOURCE_NOT_FOUND: i64 = -32002;

/// Canned server definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulatedServer {
    /// Delay before every reply
    pub delay_ms: u64,

    /// Probability (0.0..=1.0) that a tool call fails with an injected error
    pub error_rate: f64,

    /// Tokens accepted at `initialize`; empty accepts any caller
    pub accepted_tokens: Vec<String>,

    /// Advertised tools
    pub tools: Vec<SimulatedTool>,

    /// Readable resources
    pub resources: Vec<SimulatedResource>,

    /// Parameterized prompts
    pub prompts: Vec<SimulatedPrompt>,
}

/// Canned tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatedTool {
    /// Tool name
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Input schema advertised in `tools/list`
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,

    /// Result returned verbatim by `tools/call`
    #[serde(default)]
    pub result: Value,

    /// Overrides the server delay for this tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// When set, every call fails with this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Accept calls but never answer them
    #[serde(default)]
    pub never_respond: bool,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl SimulatedTool {
    /// Tool that returns `result`
    pub fn new(name: impl Into<String>, result: Value) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: empty_object_schema(),
            result,
            delay_ms: None,
            error: None,
            never_respond: false,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the input schema
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Delay replies to this tool
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Fail every call with `message`
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Never answer calls
    pub fn never_responding(mut self) -> Self {
        self.never_respond = true;
        self
    }

    fn descriptor(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Canned resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulatedResource {
    /// Resource URI
    pub uri: String,

    /// Display name
    pub name: String,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    /// Body returned by `resources/read`
    #[serde(default)]
    pub text: String,
}

/// Canned prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimulatedPrompt {
    /// Prompt name
    pub name: String,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared arguments
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,

    /// Message text; `{{arg}}` is replaced by the argument value
    #[serde(default)]
    pub template: String,
}

impl SimulatedPrompt {
    fn render(&self, arguments: &serde_json::Map<String, Value>) -> Result<String, RpcError> {
        let mut text = self.template.clone();
        for declared in &self.arguments {
            let value = match arguments.get(&declared.name) {
                Some(Value::String(value)) => value.clone(),
                Some(other) => other.to_string(),
                None if declared.required => {
                    return Err(RpcError::invalid_params(format!(
                        "Missing required argument '{}'",
                        declared.name
                    )))
                }
                None => String::new(),
            };
            text = text.replace(&format!("{{{{{}}}}}", declared.name), &value);
        }
        Ok(text)
    }
}

/// In-process store of simulated servers, keyed by simulation id
#[derive(Debug, Clone, Default)]
pub struct SimulationStore {
    servers: Arc<RwLock<HashMap<String, Arc<SimulatedServer>>>>,
}

impl SimulationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition
    pub fn insert(&self, id: impl Into<String>, server: SimulatedServer) {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), Arc::new(server));
    }

    /// Look up a definition
    pub fn get(&self, id: &str) -> Option<Arc<SimulatedServer>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Remove a definition
    pub fn remove(&self, id: &str) -> Option<Arc<SimulatedServer>> {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Whether a definition exists
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

/// Outcome of handling one request
#[derive(Debug)]
enum Reply {
    After(Duration, McpResponse),
    Never,
}

/// Answer one request from a canned definition
fn handle(
    simulation_id: &str,
    server: &SimulatedServer,
    credential: Option<&str>,
    request: &McpRequest,
) -> Reply {
    let id = request.id;
    let delay = Duration::from_millis(server.delay_ms);
    let params = request.params.clone().unwrap_or(Value::Null);
    let reply = |result: Result<Value, RpcError>| match result {
        Ok(value) => McpResponse::ok(id, value),
        Err(error) => McpResponse::err(id, error),
    };
    let encode = |value: serde_json::Result<Value>| {
        value.map_err(|e| RpcError::internal_error(e.to_string()))
    };

    match McpMethod::from(request.method.as_str()) {
        McpMethod::Initialize => {
            let authorized = server.accepted_tokens.is_empty()
                || credential
                    .map(|token| server.accepted_tokens.iter().any(|t| t == token))
                    .unwrap_or(false);
            if !authorized {
                return Reply::After(
                    delay,
                    McpResponse::err(id, RpcError::unauthorized("Invalid or missing credential")),
                );
            }
            let result = InitializeResult {
                protocol_version: MCP_PROTOCOL_VERSION.to_string(),
                capabilities: json!({"tools": {}, "resources": {}, "prompts": {}}),
                server_info: ServerInfo {
                    name: simulation_id.to_string(),
                    version: "simulated".to_string(),
                },
            };
            Reply::After(delay, reply(encode(serde_json::to_value(result))))
        }

        McpMethod::ToolsList => {
            let result = ListToolsResult {
                tools: server.tools.iter().map(SimulatedTool::descriptor).collect(),
                next_cursor: None,
            };
            Reply::After(delay, reply(encode(serde_json::to_value(result))))
        }

        McpMethod::ToolsCall => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let Some(tool) = server.tools.iter().find(|tool| tool.name == name) else {
                let error = RpcError::invalid_params(format!("Unknown tool: {}", name));
                return Reply::After(delay, McpResponse::err(id, error));
            };
            if tool.never_respond {
                return Reply::Never;
            }

            let delay = tool.delay_ms.map(Duration::from_millis).unwrap_or(delay);
            if let Some(message) = &tool.error {
                let error = RpcError::server_error(message.clone());
                return Reply::After(delay, McpResponse::err(id, error));
            }
            if server.error_rate > 0.0 && fastrand::f64() < server.error_rate {
                return Reply::After(
                    delay,
                    McpResponse::err(id, RpcError::internal_error("Simulated failure")),
                );
            }
            Reply::After(delay, McpResponse::ok(id, tool.result.clone()))
        }

        McpMethod::ResourcesList => {
            let result = ListResourcesResult {
                resources: server
                    .resources
                    .iter()
                    .map(|resource| Resource {
                        uri: resource.uri.clone(),
                        name: resource.name.clone(),
                        description: resource.description.clone(),
                        mime_type: resource.mime_type.clone(),
                    })
                    .collect(),
                next_cursor: None,
            };
            Reply::After(delay, reply(encode(serde_json::to_value(result))))
        }

        McpMethod::ResourcesRead => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            let result = match server.resources.iter().find(|resource| resource.uri == uri) {
                Some(resource) => encode(serde_json::to_value(ReadResourceResult {
                    contents: vec![ResourceContents {
                        uri: resource.uri.clone(),
                        mime_type: resource.mime_type.clone(),
                        text: Some(resource.text.clone()),
                        blob: None,
                    }],
                })),
                None => Err(RpcError::new(
                    RESOURCE_NOT_FOUND,
                    format!("Resource not found: {}", uri),
                )),
            };
            Reply::After(delay, reply(result))
        }

        McpMethod::PromptsList => {
            let result = ListPromptsResult {
                prompts: server
                    .prompts
                    .iter()
                    .map(|prompt| Prompt {
                        name: prompt.name.clone(),
                        description: prompt.description.clone(),
                        arguments: prompt.arguments.clone(),
                    })
                    .collect(),
                next_cursor: None,
            };
            Reply::After(delay, reply(encode(serde_json::to_value(result))))
        }

        McpMethod::PromptsGet => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let empty = serde_json::Map::new();
            let arguments = params
                .get("arguments")
                .and_then(Value::as_object)
                .unwrap_or(&empty);

            let result = match server.prompts.iter().find(|prompt| prompt.name == name) {
                Some(prompt) => prompt.render(arguments).and_then(|text| {
                    encode(serde_json::to_value(GetPromptResult {
                        description: prompt.description.clone(),
                        messages: vec![PromptMessage {
                            role: "user".to_string(),
                            content: json!({"type": "text", "text": text}),
                        }],
                    }))
                }),
                None => Err(RpcError::invalid_params(format!("Unknown prompt: {}", name))),
            };
            Reply::After(delay, reply(result))
        }

        McpMethod::Initialized | McpMethod::Custom(_) => Reply::After(
            delay,
            McpResponse::err(id, RpcError::method_not_found(request.method.clone())),
        ),
    }
}

/// Transport backed by a [`SimulationStore`] entry
pub struct SimulatedTransport {
    server: String,
    simulation_id: String,
    credential: Option<String>,
    store: SimulationStore,
    definition: Mutex<Option<Arc<SimulatedServer>>>,
    inbound: Mutex<Option<InboundSink>>,
    replies: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl SimulatedTransport {
    /// Create an unconnected transport
    pub fn new(
        server: &str,
        simulation_id: &str,
        credential: Option<String>,
        store: SimulationStore,
    ) -> Self {
        Self {
            server: server.to_string(),
            simulation_id: simulation_id.to_string(),
            credential,
            store,
            definition: Mutex::new(None),
            inbound: Mutex::new(None),
            replies: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Replies scheduled but not yet delivered
    pub fn in_flight(&self) -> usize {
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        replies.retain(|reply| !reply.is_finished());
        replies.len()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self, inbound: InboundSink) -> BrokerResult<()> {
        let definition = self.store.get(&self.simulation_id).ok_or_else(|| {
            BrokerError::transport(
                &self.server,
                format!("unknown simulation '{}'", self.simulation_id),
            )
        })?;

        tracing::debug!(
            "Simulated MCP server '{}' attached to simulation '{}'",
            self.server,
            self.simulation_id
        );

        *self.definition.lock().unwrap_or_else(PoisonError::into_inner) = Some(definition);
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &OutboundMessage) -> BrokerResult<()> {
        if !self.is_connected() {
            return Err(BrokerError::transport(&self.server, "transport is not connected"));
        }

        let OutboundMessage::Request(request) = message else {
            // notifications need no answer
            return Ok(());
        };

        let definition = self
            .definition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (Some(definition), Some(inbound)) = (definition, inbound) else {
            return Err(BrokerError::transport(&self.server, "transport is not connected"));
        };

        match handle(
            &self.simulation_id,
            &definition,
            self.credential.as_deref(),
            request,
        ) {
            Reply::Never => {
                tracing::debug!(
                    "Simulated MCP server '{}' will not answer request {}",
                    self.server,
                    request.id
                );
            }
            Reply::After(delay, response) => {
                let task = tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = inbound.send(InboundMessage::Response(response));
                });
                let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
                replies.retain(|reply| !reply.is_finished());
                replies.push(task);
            }
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        for reply in self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            reply.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        for reply in self
            .replies
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            reply.abort();
        }
    }
}
