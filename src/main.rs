// MCP Broker - Main Entry Point
//
// Command-line front-end for the broker:
// - status / tools: inspect configured servers and the aggregated catalog
// - call: invoke one tool by qualified name
// - serve: keep connections open with session sweeping and metrics

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_broker::config::Config;
use mcp_broker::mcp::retry::{retry_with_backoff, RetryConfig};
use mcp_broker::mcp::McpManager;
use mcp_broker::metrics_server;
use serde_json::Value;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// MCP Broker: one front door for many MCP servers
#[derive(Parser, Debug)]
#[command(name = "mcp-broker")]
#[command(version)]
#[command(
    about = "Connect to MCP servers, aggregate their tools and route tool calls",
    long_about = None
)]
struct Args {
    /// Configuration file (default: <config dir>/mcp-broker/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the connectivity of every configured server as JSON
    Status {
        /// Include the connections of this session
        #[arg(long)]
        session: Option<String>,
    },
    /// Print the aggregated tool catalog as JSON
    Tools {
        /// Include the connections of this session
        #[arg(long)]
        session: Option<String>,

        /// Print function-calling payloads with simplified schemas
        #[arg(long)]
        llm: bool,
    },
    /// Call a tool by its qualified `<server>__<tool>` name
    Call {
        /// Qualified tool name
        name: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Session id used to pick or open a session connection
        #[arg(long)]
        session: Option<String>,

        /// User token for servers that require authentication
        #[arg(long, env = "MCP_BROKER_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Attempts for transient failures (1 = no retry)
        #[arg(long, default_value_t = 1)]
        retries: usize,
    },
    /// Keep connections open until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    init_logging(&config, args.verbose)?;

    info!("MCP Broker v{} starting...", env!("CARGO_PKG_VERSION"));

    let manager = Arc::new(McpManager::from_config(&config));
    let failures = manager.initialize(config.server_configs()).await;
    for (server, e) in &failures {
        warn!("MCP server '{}' unavailable: {}", server, e);
    }

    let outcome = match args.command {
        Commands::Status { session } => print_json(&manager.get_status(session.as_deref())),
        Commands::Tools { session, llm } => {
            if llm {
                print_json(&manager.get_tools_for_llm(session.as_deref()))
            } else {
                print_json(&manager.get_all_tools(session.as_deref()))
            }
        }
        Commands::Call {
            name,
            args,
            session,
            token,
            retries,
        } => {
            call_tool(
                &manager,
                &name,
                &args,
                session.as_deref(),
                token.as_deref(),
                retries,
            )
            .await
        }
        Commands::Serve => serve(Arc::clone(&manager), &config).await,
    };

    manager.disconnect_all().await;
    outcome
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // stdout carries command output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

async fn call_tool(
    manager: &McpManager,
    name: &str,
    args: &str,
    session: Option<&str>,
    token: Option<&str>,
    attempts: usize,
) -> Result<()> {
    let arguments: Value =
        serde_json::from_str(args).with_context(|| format!("Invalid --args JSON: {}", args))?;

    let retry = RetryConfig::new().max_attempts(attempts);
    let result = retry_with_backoff(&retry, || {
        manager.call_tool_by_full_name(name, arguments.clone(), session, token)
    })
    .await
    .with_context(|| format!("Tool call '{}' failed", name))?;

    print_json(&result)
}

async fn serve(manager: Arc<McpManager>, config: &Config) -> Result<()> {
    let sweeper = manager.spawn_session_sweeper(
        config.sessions.sweep_interval(),
        config.sessions.idle_timeout(),
    );

    let metrics = config.metrics.enabled.then(|| {
        let port = config.metrics.port;
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_metrics_server(port, manager).await {
                error!("Metrics server stopped: {:#}", e);
            }
        })
    });

    let connected = manager
        .get_status(None)
        .iter()
        .filter(|status| status.connected)
        .count();
    info!(
        "Serving {} MCP server(s), {} connected; press Ctrl-C to stop",
        manager.server_configs().len(),
        connected
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");

    sweeper.abort();
    if let Some(metrics) = metrics {
        metrics.abort();
    }
    Ok(())
}
