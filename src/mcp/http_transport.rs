//! MCP HTTP Event-Stream Transport
//!
//! This module implements the stream transport for remote MCP servers.
//!
//! # Architecture
//!
//! The client opens a long-lived `GET` with `Accept: text/event-stream`. The
//! server first emits an `endpoint` event naming the URL that outbound
//! messages are POSTed to; afterwards every `message` event carries one
//! JSON-RPC message. Some servers answer the POST directly with a JSON body
//! instead of (or as well as) an event; such bodies are fed into the same
//! inbound sink, so correlation never depends on where a reply arrived.
//!
//! # Example
//!
//! ```ignore
//! let transport = SseTransport::new("github", "https://mcp.example.com/sse", headers);
//! transport.connect(sink).await?;
//! transport.send(&request.into()).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::TransportKind;
use crate::mcp::error::{BrokerError, BrokerResult};
use crate::mcp::protocol::{InboundMessage, OutboundMessage};
use crate::mcp::transport::{InboundSink, Transport};

/// Event-stream transport for remote MCP servers
pub struct SseTransport {
    server: String,
    url: String,
    headers: BTreeMap<String, String>,
    client: Mutex<Option<reqwest::Client>>,
    endpoint: Mutex<Option<Url>>,
    inbound: Mutex<Option<InboundSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl SseTransport {
    /// Create an unconnected transport
    pub fn new(server: &str, url: &str, headers: BTreeMap<String, String>) -> Self {
        Self {
            server: server.to_string(),
            url: url.to_string(),
            headers,
            client: Mutex::new(None),
            endpoint: Mutex::new(None),
            inbound: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Event stream URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST endpoint announced by the server, once connected
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.lock().ok().and_then(|endpoint| endpoint.clone())
    }

    fn with_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn push_inbound(&self, message: InboundMessage) {
        if let Ok(inbound) = self.inbound.lock() {
            if let Some(inbound) = inbound.as_ref() {
                let _ = inbound.send(message);
            }
        }
    }
}

/// One parsed event-stream block
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Split the first complete event block off the front of `buffer`
///
/// Lines may end in `\n`, `\r\n` or a lone `\r`; a block ends at the first
/// blank line. Works on raw bytes so a character split across network chunks
/// is only decoded once both halves have arrived.
fn next_event_block(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut line_start = 0;
    let mut i = 0;

    while i < buffer.len() {
        let terminator = match buffer[i] {
            b'\n' => 1,
            b'\r' => match buffer.get(i + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                // blank line already; a trailing '\n' is skipped with the next block
                None if i == line_start && i > 0 => 1,
                // may be the first half of "\r\n"
                None => return None,
            },
            _ => {
                i += 1;
                continue;
            }
        };

        if i == line_start && i > 0 {
            let block = buffer[..i].to_vec();
            buffer.drain(..i + terminator);
            return Some(block);
        }
        i += terminator;
        line_start = i;
    }
    None
}

/// Parse one event block (the text between blank lines)
fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.split(['\n', '\r']) {
        if line.starts_with(':') {
            continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(value) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        {
            data.push(value);
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self, inbound: InboundSink) -> BrokerResult<()> {
        let base = Url::parse(&self.url)
            .map_err(|e| BrokerError::transport(&self.server, format!("invalid URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::transport(&self.server, e))?;

        tracing::info!("Opening event stream to MCP server '{}': {}", self.server, self.url);

        let response = self
            .with_headers(client.get(base.clone()).header(ACCEPT, "text/event-stream"))
            .send()
            .await
            .map_err(|e| BrokerError::transport(&self.server, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::transport(
                &self.server,
                format!("event stream returned HTTP {}", status),
            ));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let server = self.server.clone();
        let connected = Arc::clone(&self.connected);
        let sink = inbound.clone();
        self.connected.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut endpoint_tx = Some(endpoint_tx);

            'stream: while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => buffer.extend_from_slice(&bytes),
                    Err(e) => {
                        tracing::warn!("Event stream from MCP server '{}' failed: {}", server, e);
                        break;
                    }
                }

                while let Some(block) = next_event_block(&mut buffer) {
                    let block = match String::from_utf8(block) {
                        Ok(block) => block,
                        Err(e) => {
                            tracing::warn!(
                                "Skipping event with invalid UTF-8 from MCP server '{}': {}",
                                server,
                                e
                            );
                            continue;
                        }
                    };
                    let Some(event) = parse_event(&block) else {
                        continue;
                    };

                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        "message" => match InboundMessage::parse_str(&event.data) {
                            Some(message) => {
                                if sink.send(message).is_err() {
                                    break 'stream;
                                }
                            }
                            None => tracing::debug!(
                                "Ignoring malformed event from MCP server '{}': {}",
                                server,
                                event.data
                            ),
                        },
                        other => tracing::debug!(
                            "Ignoring '{}' event from MCP server '{}'",
                            other,
                            server
                        ),
                    }
                }
            }

            tracing::info!("Event stream from MCP server '{}' ended", server);
            connected.store(false, Ordering::SeqCst);
        });

        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }

        let endpoint = match endpoint_rx.await {
            Ok(endpoint) => endpoint,
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(BrokerError::transport(
                    &self.server,
                    "event stream closed before announcing an endpoint",
                ));
            }
        };
        let endpoint = base.join(endpoint.trim()).map_err(|e| {
            BrokerError::transport(&self.server, format!("invalid endpoint '{}': {}", endpoint, e))
        })?;
        tracing::debug!("MCP server '{}' message endpoint: {}", self.server, endpoint);

        if let Ok(mut slot) = self.endpoint.lock() {
            *slot = Some(endpoint);
        }
        if let Ok(mut slot) = self.client.lock() {
            *slot = Some(client);
        }
        if let Ok(mut slot) = self.inbound.lock() {
            *slot = Some(inbound);
        }
        Ok(())
    }

    /// POST one message to the announced endpoint
    async fn send(&self, message: &OutboundMessage) -> BrokerResult<()> {
        if !self.is_connected() {
            return Err(BrokerError::transport(&self.server, "transport is not connected"));
        }

        let client = self.client.lock().ok().and_then(|client| client.clone());
        let (Some(client), Some(endpoint)) = (client, self.endpoint()) else {
            return Err(BrokerError::transport(&self.server, "no message endpoint"));
        };

        let body = message
            .to_value()
            .map_err(|e| BrokerError::transport(&self.server, e))?;
        tracing::trace!("Posting to MCP server '{}': {}", self.server, body);

        let response = self
            .with_headers(client.post(endpoint).json(&body))
            .send()
            .await
            .map_err(|e| BrokerError::transport(&self.server, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::transport(
                &self.server,
                format!("POST returned HTTP {}", status),
            ));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Ok(());
        }

        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::transport(&self.server, e))?;
        if text.trim().is_empty() {
            return Ok(());
        }
        match InboundMessage::parse_str(&text) {
            Some(message) => self.push_inbound(message),
            None => tracing::debug!(
                "Ignoring non-JSON-RPC POST body from MCP server '{}': {}",
                self.server,
                text
            ),
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
        if let Ok(mut endpoint) = self.endpoint.lock() {
            endpoint.take();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::mcp::connection::Connection;
    use crate::mcp::protocol::McpRequest;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn blocks(buffer: &mut Vec<u8>) -> Vec<String> {
        std::iter::from_fn(|| next_event_block(buffer))
            .map(|block| String::from_utf8(block).unwrap())
            .collect()
    }

    #[test]
    fn test_event_blocks_with_each_line_ending() {
        let mut buffer = b"data: a\n\ndata: b\r\n\r\ndata: c\r\rdata: d".to_vec();
        let found = blocks(&mut buffer);

        assert_eq!(found, vec!["data: a\n", "data: b\r\n", "data: c\r"]);
        assert_eq!(parse_event(&found[1]).unwrap().data, "b");
        assert_eq!(buffer, b"data: d");
    }

    #[test]
    fn test_event_block_waits_for_split_crlf() {
        let mut buffer = b"data: a\r\n\r".to_vec();
        // the blank line is complete once a second line ending starts
        assert_eq!(blocks(&mut buffer), vec!["data: a\r\n"]);

        let mut buffer = b"data: a\r".to_vec();
        assert!(next_event_block(&mut buffer).is_none());
        buffer.extend_from_slice(b"\n\r\n");
        assert_eq!(blocks(&mut buffer), vec!["data: a\r\n"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_event_block_keeps_split_character() {
        let text = "data: caf\u{e9}\n\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut buffer = text[..split].to_vec();
        assert!(next_event_block(&mut buffer).is_none());
        buffer.extend_from_slice(&text[split..]);

        let found = blocks(&mut buffer);
        assert_eq!(parse_event(&found[0]).unwrap().data, "caf\u{e9}");
    }

    #[test]
    fn test_parse_event_with_crlf_lines() {
        let event = parse_event("event: endpoint\r\ndata: /messages\r\n").unwrap();
        assert_eq!(event.event, "endpoint");
        assert_eq!(event.data, "/messages");
    }

    #[test]
    fn test_parse_endpoint_event() {
        let event = parse_event("event: endpoint\ndata: /messages?session=abc").unwrap();
        assert_eq!(event.event, "endpoint");
        assert_eq!(event.data, "/messages?session=abc");
    }

    #[test]
    fn test_parse_default_event_name() {
        let event = parse_event("data:{\"jsonrpc\":\"2.0\"}").unwrap();
        assert_eq!(event.event, "message");
        assert_eq!(event.data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn test_parse_multiline_data_and_comments() {
        let event = parse_event(": keep-alive\ndata: line one\ndata: line two").unwrap();
        assert_eq!(event.data, "line one\nline two");
        assert!(parse_event(": ping").is_none());
    }

    #[test]
    fn test_transport_trait_bounds() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SseTransport>();
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let transport = SseTransport::new("remote", "http://127.0.0.1:1/sse", BTreeMap::new());
        let result = transport
            .send(&McpRequest::new(1, "tools/list", None).into())
            .await;

        assert!(matches!(result, Err(BrokerError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            SseTransport::new("remote", &format!("http://{}/sse", addr), BTreeMap::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = transport.connect(tx).await;
        assert!(matches!(result, Err(BrokerError::Transport { .. })));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_endpoint_and_message_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();

            let body = concat!(
                ": hello\n\n",
                "event: endpoint\ndata: /messages?session=1\n\n",
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{}}\n\n",
            );
            let response = format!(
                concat!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n",
                    "cache-control: no-cache\r\n\r\n{}"
                ),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // hold the stream open
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport =
            SseTransport::new("remote", &format!("http://{}/sse", addr), BTreeMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::time::timeout(Duration::from_secs(5), transport.connect(tx))
            .await
            .unwrap()
            .unwrap();

        let endpoint = transport.endpoint().unwrap();
        assert_eq!(endpoint.path(), "/messages");
        assert_eq!(endpoint.query(), Some("session=1"));

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.response_id(), Some(5));

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();

            let head = concat!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n",
                "event: endpoint\r\ndata: /messages\r\n\r\n",
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();

            let message = concat!(
                "event: message\r\n",
                "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"text\":\"caf\u{e9}\"}}\r\n\r",
                "\n",
                "data: {\"jsonrpc\":\"2.0\",\"id\":8,\"result\":{}}\r\n\r\n",
            )
            .as_bytes();
            let split = message.iter().position(|&b| b == 0xC3).unwrap() + 1;
            // between the '\r' and '\n' ending the data line
            let crlf = split
                + message[split..]
                    .windows(2)
                    .position(|w| w == b"\r\n")
                    .unwrap()
                + 1;
            for part in [&message[..split], &message[split..crlf], &message[crlf..]] {
                socket.write_all(part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport =
            SseTransport::new("remote", &format!("http://{}/sse", addr), BTreeMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::time::timeout(Duration::from_secs(5), transport.connect(tx))
            .await
            .unwrap()
            .unwrap();

        let mut replies = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let InboundMessage::Response(response) = message else {
                panic!("expected a response, got {:?}", message);
            };
            replies.push(response);
        }

        assert_eq!(replies[0].id, 7);
        assert_eq!(replies[0].result, Some(json!({"text": "caf\u{e9}"})));
        assert_eq!(replies[1].id, 8);

        transport.close().await.unwrap();
        server.abort();
    }

    /// In-process MCP server speaking the event-stream transport
    #[derive(Clone)]
    struct EventStreamServer {
        events: mpsc::UnboundedSender<String>,
        stream: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
        posted: Arc<Mutex<Vec<String>>>,
    }

    impl EventStreamServer {
        fn new() -> Self {
            let (events, stream) = mpsc::unbounded_channel();
            let _ = events.send("event: endpoint\ndata: /messages?session=1\n\n".to_string());
            Self {
                events,
                stream: Arc::new(Mutex::new(Some(stream))),
                posted: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn push_message(&self, message: Value) {
            let _ = self
                .events
                .send(format!("event: message\ndata: {}\n\n", message));
        }

        async fn serve(self) -> String {
            let app = Router::new()
                .route("/sse", get(open_stream))
                .route("/messages", post(receive_message))
                .with_state(self);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { axum::serve(listener, app).await });
            format!("http://{}/sse", addr)
        }
    }

    async fn open_stream(State(server): State<EventStreamServer>) -> Response {
        let Some(events) = server.stream.lock().unwrap().take() else {
            return StatusCode::CONFLICT.into_response();
        };
        let body = futures::stream::unfold(events, |mut events| async move {
            events
                .recv()
                .await
                .map(|event| (Ok::<_, Infallible>(event), events))
        });
        ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
    }

    /// `initialize` and `tools/list` are answered on the stream, `tools/call`
    /// in the POST body
    async fn receive_message(
        State(server): State<EventStreamServer>,
        Json(message): Json<Value>,
    ) -> Response {
        let method = message["method"].as_str().unwrap_or_default().to_string();
        server.posted.lock().unwrap().push(method.clone());

        let Some(id) = message["id"].as_u64() else {
            return StatusCode::ACCEPTED.into_response();
        };
        let reply = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result});

        match method.as_str() {
            "initialize" => server.push_message(reply(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "remote", "version": "1.0.0"}
            }))),
            "tools/list" => server.push_message(reply(json!({
                "tools": [{"name": "lookup", "inputSchema": {"type": "object"}}]
            }))),
            "tools/call" => {
                let text = format!("caf\u{e9} {}", message["params"]["arguments"]["q"]);
                return Json(reply(json!({"content": [{"type": "text", "text": text}]})))
                    .into_response();
            }
            _ => {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "Method not found"}
                }))
                .into_response()
            }
        }
        StatusCode::ACCEPTED.into_response()
    }

    #[tokio::test]
    async fn test_send_posts_to_announced_endpoint() {
        let server = EventStreamServer::new();
        let posted = Arc::clone(&server.posted);
        let url = server.serve().await;

        let transport = SseTransport::new("remote", &url, BTreeMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        assert_eq!(transport.endpoint().unwrap().path(), "/messages");

        // answered through the JSON body of the POST
        transport
            .send(&McpRequest::new(3, "tools/call", Some(json!({"arguments": {"q": 1}}))).into())
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.response_id(), Some(3));

        // answered through the event stream
        transport
            .send(&McpRequest::new(4, "tools/list", None).into())
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.response_id(), Some(4));

        assert_eq!(*posted.lock().unwrap(), vec!["tools/call", "tools/list"]);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_over_event_stream() {
        let server = EventStreamServer::new();
        let posted = Arc::clone(&server.posted);
        let url = server.serve().await;

        let config = ServerConfig::sse("remote", url.clone()).with_timeout(Duration::from_secs(5));
        let transport = Arc::new(SseTransport::new("remote", &url, BTreeMap::new()));
        let connection = Connection::with_transport(config, transport);

        connection.connect().await.unwrap();
        assert!(connection.is_connected());
        let tools = connection.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");

        let result = connection
            .call_tool_raw("lookup", json!({"q": "x"}))
            .await
            .unwrap();
        assert_eq!(
            result,
            json!({"content": [{"type": "text", "text": "caf\u{e9} \"x\""}]})
        );

        let posted = posted.lock().unwrap().clone();
        assert_eq!(posted.first().map(String::as_str), Some("initialize"));
        assert_eq!(posted.last().map(String::as_str), Some("tools/call"));

        connection.disconnect().await;
        assert!(!connection.is_connected());
    }
}
