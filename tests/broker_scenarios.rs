//! Broker scenario tests
//!
//! End-to-end behaviour through [`McpManager`] against simulated servers.

use std::sync::Arc;
use std::time::Duration;

use mcp_broker::config::ServerConfig;
use mcp_broker::mcp::protocol::PromptArgument;
use mcp_broker::mcp::simulated::{SimulatedPrompt, SimulatedResource};
use mcp_broker::mcp::{
    BrokerError, ConnectionScope, McpManager, SimulatedServer, SimulatedTool, SimulationStore,
};
use serde_json::json;

fn echo_simulation() -> SimulatedServer {
    SimulatedServer {
        tools: vec![
            SimulatedTool::new("ping", json!({"status": "ok"})).with_input_schema(json!({
                "type": "object",
                "title": "PingArgs",
                "properties": {"host": {"type": "string", "default": "localhost"}},
                "required": ["host"]
            })),
            SimulatedTool::new("slow", json!("done")).with_delay(Duration::from_millis(40)),
            SimulatedTool::new("hang", json!(null)).never_responding(),
        ],
        resources: vec![SimulatedResource {
            uri: "file:///motd".to_string(),
            name: "motd".to_string(),
            description: None,
            mime_type: Some("text/plain".to_string()),
            text: "hello".to_string(),
        }],
        prompts: vec![SimulatedPrompt {
            name: "greet".to_string(),
            description: None,
            arguments: vec![PromptArgument {
                name: "name".to_string(),
                description: None,
                required: true,
            }],
            template: "Hello {{name}}".to_string(),
        }],
        ..Default::default()
    }
}

fn files_simulation() -> SimulatedServer {
    SimulatedServer {
        accepted_tokens: vec!["token-a".to_string(), "token-b".to_string()],
        tools: vec![SimulatedTool::new("read", json!({"content": "secret"}))],
        ..Default::default()
    }
}

async fn broker() -> Arc<McpManager> {
    let store = SimulationStore::new();
    store.insert("echo", echo_simulation());
    store.insert("files", files_simulation());

    let manager = Arc::new(McpManager::new(store));
    let failures = manager
        .initialize(vec![
            ServerConfig::simulated("echo", "echo").with_timeout(Duration::from_millis(300)),
            ServerConfig::simulated("files", "files")
                .with_requires_auth(true)
                .with_description("Team files"),
        ])
        .await;
    assert!(failures.is_empty(), "unexpected failures: {:?}", failures);
    manager
}

#[tokio::test]
async fn test_echo_ping_returns_canned_result() {
    let manager = broker().await;

    let result = manager
        .call_tool_by_full_name("echo__ping", json!({}), None, None)
        .await
        .unwrap();
    assert_eq!(result, json!({"status": "ok"}));

    let result = manager.call_tool("echo", "ping", json!({}), None).await.unwrap();
    assert_eq!(result, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_files_requires_session_token() {
    let manager = broker().await;

    let err = manager
        .call_tool_by_full_name("files__read", json!({}), Some("session-a"), None)
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::AuthRequired("files".to_string()));

    let result = manager
        .call_tool_by_full_name("files__read", json!({}), Some("session-a"), Some("token-a"))
        .await
        .unwrap();
    assert_eq!(result, json!({"content": "secret"}));

    // session A keeps its connection without resending the token
    let result = manager
        .call_tool_by_full_name("files__read", json!({}), Some("session-a"), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"content": "secret"}));

    let err = manager
        .call_tool_by_full_name("files__read", json!({}), Some("session-b"), None)
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::AuthRequired("files".to_string()));
}

#[tokio::test]
async fn test_rejected_token_is_auth_required() {
    let manager = broker().await;

    let err = manager
        .call_tool_by_full_name("files__read", json!({}), Some("s"), Some("wrong"))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::AuthRequired("files".to_string()));
    assert!(manager.registry().session("s", "files").is_none());
}

#[tokio::test]
async fn test_not_connected_names_server() {
    let manager = broker().await;
    manager.disconnect_server("echo").await.unwrap();

    for session in [None, Some("session-a")] {
        let err = manager
            .call_tool_by_full_name("echo__ping", json!({}), session, None)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NotConnected("echo".to_string()));
    }
}

#[tokio::test]
async fn test_catalog_shows_placeholder_without_session() {
    let manager = broker().await;

    let files: Vec<_> = manager
        .get_all_tools(None)
        .into_iter()
        .filter(|tool| tool.server == "files")
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].placeholder);
    assert!(files[0].requires_auth);
    assert_ne!(files[0].name, "read");

    let llm = manager.get_tools_for_llm(None);
    let names: Vec<&str> = llm
        .iter()
        .filter_map(|tool| tool["function"]["name"].as_str())
        .collect();
    assert_eq!(names, vec!["echo__ping", "echo__slow", "echo__hang"]);
    assert_eq!(
        llm[0]["function"]["parameters"],
        json!({
            "type": "object",
            "properties": {"host": {"type": "string"}},
            "required": ["host"]
        })
    );
}

#[tokio::test]
async fn test_catalog_shows_real_tools_for_authenticated_session() {
    let manager = broker().await;
    manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();

    let tools = manager.get_all_tools(Some("session-a"));
    let read = tools
        .iter()
        .find(|tool| tool.qualified_name == "files__read")
        .expect("real tool listed");
    assert!(read.requires_auth);
    assert!(!read.placeholder);

    // other sessions still see the placeholder
    assert!(manager
        .get_all_tools(Some("session-b"))
        .iter()
        .any(|tool| tool.server == "files" && tool.placeholder));
}

#[tokio::test]
async fn test_sessions_get_distinct_connections() {
    let manager = broker().await;

    let a = manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();
    let b = manager
        .get_user_connection("session-b", "files", "token-b")
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(a.config().credential(), Some("token-a"));
    assert_eq!(b.config().credential(), Some("token-b"));

    let again = manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&a, &again));
}

#[tokio::test]
async fn test_timeout_clears_pending_entry() {
    let manager = broker().await;

    let err = manager
        .call_tool_by_full_name("echo__hang", json!({}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::RequestTimeout { ref server, timeout_ms: 300, .. } if server == "echo"
    ));

    let connection = manager.registry().shared("echo").unwrap();
    assert_eq!(connection.pending_count(), 0);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_concurrent_calls_are_not_crossed() {
    let manager = broker().await;

    let calls = (0..8).map(|i| {
        let manager = Arc::clone(&manager);
        let tool = if i % 2 == 0 { "echo__slow" } else { "echo__ping" };
        tokio::spawn(async move {
            let result = manager
                .call_tool_by_full_name(tool, json!({"i": i}), None, None)
                .await;
            (tool, result)
        })
    });

    for outcome in futures::future::join_all(calls).await {
        let (tool, result) = outcome.unwrap();
        let expected = if tool == "echo__slow" {
            json!("done")
        } else {
            json!({"status": "ok"})
        };
        assert_eq!(result.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_resources_and_prompts() {
    let manager = broker().await;

    let resources = manager.list_resources("echo", None).await.unwrap();
    assert_eq!(resources.len(), 1);

    let read = manager
        .read_resource("echo", "file:///motd", None)
        .await
        .unwrap();
    assert_eq!(read.contents[0].text.as_deref(), Some("hello"));

    let err = manager
        .read_resource("echo", "file:///missing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Rpc { .. }));

    let prompts = manager.list_prompts("echo", None).await.unwrap();
    assert_eq!(prompts[0].name, "greet");

    let prompt = manager
        .get_prompt("echo", "greet", json!({"name": "Ada"}), None)
        .await
        .unwrap();
    assert_eq!(prompt.messages[0].content["text"], "Hello Ada");

    let err = manager
        .get_prompt("echo", "greet", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Rpc { code: -32602, .. }));
}

#[tokio::test]
async fn test_status_reports_scope() {
    let manager = broker().await;
    manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();

    let status = manager.get_status(None);
    let files = status.iter().find(|s| s.name == "files").unwrap();
    assert!(files.requires_auth);
    assert!(!files.connected);

    let status = manager.get_status(Some("session-a"));
    let files = status.iter().find(|s| s.name == "files").unwrap();
    assert!(files.connected);
    assert_eq!(files.scope, Some(ConnectionScope::Session));
    assert_eq!(files.tool_count, 1);

    let echo = status.iter().find(|s| s.name == "echo").unwrap();
    assert_eq!(echo.scope, Some(ConnectionScope::Shared));
    assert_eq!(echo.tool_count, 3);
}

#[tokio::test]
async fn test_disconnect_user_session() {
    let manager = broker().await;
    let connection = manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();

    assert_eq!(manager.disconnect_user_session("session-a").await, 1);
    assert!(!connection.is_connected());
    assert!(!manager.disconnect_user_server("session-a", "files").await);

    let err = manager
        .call_tool_by_full_name("files__read", json!({}), Some("session-a"), None)
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::AuthRequired("files".to_string()));
}

#[tokio::test]
async fn test_remove_server_disconnects_sessions() {
    let manager = broker().await;
    let connection = manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();

    manager.remove_server_config("files").await.unwrap();
    assert!(!connection.is_connected());
    assert_eq!(manager.registry().session_count(), 0);

    let err = manager
        .call_tool_by_full_name("files__read", json!({}), Some("session-a"), Some("token-a"))
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::ConfigNotFound("files".to_string()));
}

#[tokio::test]
async fn test_idle_sessions_are_swept() {
    let manager = broker().await;
    manager
        .get_user_connection("session-a", "files", "token-a")
        .await
        .unwrap();

    assert_eq!(manager.sweep_idle_sessions(Duration::from_secs(60)).await, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.sweep_idle_sessions(Duration::from_millis(10)).await, 1);
    assert_eq!(manager.registry().session_count(), 0);
}
