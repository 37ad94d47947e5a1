// HTTP server for Prometheus metrics endpoint
//
// Listens on /metrics endpoint (default: 0.0.0.0:9090)
// Used by Prometheus to scrape metrics; /health reports broker liveness.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::mcp::McpManager;
use crate::metrics;

/// Build the router serving `/metrics` and `/health`
pub fn router(manager: Arc<McpManager>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Start the metrics HTTP server
///
/// # Arguments
/// * `port` - Port to listen on (default 9090)
/// * `manager` - Broker whose status backs `/health`
pub async fn start_metrics_server(port: u16, manager: Arc<McpManager>) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind metrics server")?;

    axum::serve(listener, router(manager))
        .await
        .context("Metrics server error")?;

    Ok(())
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint: shared connection summary
async fn health_handler(State(manager): State<Arc<McpManager>>) -> impl IntoResponse {
    let status = manager.get_status(None);
    let connected = status.iter().filter(|server| server.connected).count();
    Json(serde_json::json!({
        "status": "ok",
        "servers": status.len(),
        "connected": connected,
    }))
}
