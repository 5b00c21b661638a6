use anyhow::Context as _;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tether_mcp_hub::admin::AdminState;
use tether_mcp_hub::hub::Hub;
use tether_store::ToolsCacheFile;

/// Aggregating hub: one WebSocket server for providers and frontends, plus
/// the admin API on the same listener.
#[derive(Debug, Parser)]
#[command(name = "tether-mcp-hub", version)]
struct Args {
    /// Listen address for WebSocket and admin traffic.
    #[arg(long, env = "MCP_HUB_BIND", default_value = "0.0.0.0:8900")]
    bind: SocketAddr,

    /// Store URL (postgres://… or memory:).
    #[arg(long, env = "MCP_DATABASE_URL")]
    database_url: String,

    /// When set, provider sockets must present this token or are closed
    /// with code 4001.
    #[arg(long, env = "MCP_WS_TOKEN")]
    ws_token: Option<String>,

    /// Provider config file, used by tool discovery and backup.
    #[arg(long, env = "MCP_CONFIG", default_value = "mcp_config.json")]
    config: PathBuf,

    /// Path to the stdio↔HTTP MCP proxy adapter binary.
    #[arg(long, env = "HTTP_PROXY_BIN", default_value = "mcp-proxy")]
    proxy_bin: String,

    /// Raw tool cache file shared with the bridge host.
    #[arg(long, env = "MCP_TOOLS_CACHE", default_value = "data/tools_cache.json")]
    tools_cache: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let handle = tether_store::connect(&args.database_url)
        .await
        .context("connect store")?;

    let hub = Arc::new(Hub::new(args.ws_token));
    let admin_state = Arc::new(AdminState {
        store: handle.store,
        fanout: handle.fanout,
        tools_cache: ToolsCacheFile::new(args.tools_cache),
        config_path: args.config,
        proxy_bin: args.proxy_bin,
    });

    let app = tether_mcp_hub::app(hub, admin_state);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    tracing::info!(addr = %args.bind, "hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("serve")?;

    Ok(())
}
