// Prometheus metrics for the MCP broker
//
// Exposes metrics on /metrics HTTP endpoint:
// - Active shared and session-scoped connections (gauge)
// - Tool calls by server and outcome (counter)
// - Tool call latency by server (histogram)
// - Request timeouts and connect failures (counter)

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Connection metrics
    pub static ref MCP_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "mcp_connections_active",
        "Number of live shared MCP server connections"
    ).expect("Failed to create MCP connections metric");

    pub static ref MCP_SESSION_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "mcp_session_connections_active",
        "Number of live session-scoped MCP server connections"
    ).expect("Failed to create MCP session connections metric");

    pub static ref MCP_CONNECT_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("mcp_connect_failures_total", "Total number of failed MCP connects"),
        &["server"]
    ).expect("Failed to create MCP connect failures metric");

    // Invocation metrics
    pub static ref MCP_TOOL_CALLS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("mcp_tool_calls_total", "Total number of MCP tool calls"),
        &["server", "status"]
    ).expect("Failed to create MCP tool calls metric");

    pub static ref MCP_TOOL_CALL_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "mcp_tool_call_duration_seconds",
            "Duration of MCP tool calls"
        ),
        &["server"]
    ).expect("Failed to create MCP tool call duration metric");

    pub static ref MCP_REQUEST_TIMEOUTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "mcp_request_timeouts_total",
            "Total number of MCP requests that timed out"
        ),
        &["server", "method"]
    ).expect("Failed to create MCP request timeouts metric");
}

static INIT: Once = Once::new();

/// Initialize metrics registry
///
/// Safe to call more than once; only the first call registers.
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MCP_CONNECTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(MCP_SESSION_CONNECTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(MCP_CONNECT_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MCP_TOOL_CALLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MCP_TOOL_CALL_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(MCP_REQUEST_TIMEOUTS_TOTAL.clone()))?;
    Ok(())
}

/// Record the outcome and latency of one tool call
pub fn record_tool_call(server: &str, success: bool, elapsed: Duration) {
    let status = if success { "success" } else { "error" };
    MCP_TOOL_CALLS_TOTAL.with_label_values(&[server, status]).inc();
    MCP_TOOL_CALL_DURATION_SECONDS
        .with_label_values(&[server])
        .observe(elapsed.as_secs_f64());
}

/// Record a request that received no reply in time
pub fn record_request_timeout(server: &str, method: &str) {
    MCP_REQUEST_TIMEOUTS_TOTAL
        .with_label_values(&[server, method])
        .inc();
}

/// Record a failed connect
pub fn record_connect_failure(server: &str) {
    MCP_CONNECT_FAILURES_TOTAL.with_label_values(&[server]).inc();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
