use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_mcp_bridge::reconcile::Reconciler;
use tether_mcp_bridge::supervisor::BridgeContext;
use tether_store::ToolsCacheFile;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bridge host: supervises provider processes and tunnels their stdio over
/// WebSockets to every enabled endpoint.
#[derive(Debug, Parser)]
#[command(name = "tether-mcp-bridge", version)]
struct Args {
    /// Store URL (postgres://… or memory:). Also carries the pub/sub
    /// channel for live endpoint updates.
    #[arg(long, env = "MCP_DATABASE_URL")]
    database_url: String,

    /// Provider config file ({"mcpServers": {…}}).
    #[arg(long, env = "MCP_CONFIG", default_value = "mcp_config.json")]
    config: PathBuf,

    /// Token sent to endpoints as ?token=…; endpoints may require it.
    #[arg(long, env = "MCP_WS_TOKEN")]
    ws_token: Option<String>,

    /// Path to the stdio↔HTTP MCP proxy adapter binary.
    #[arg(long, env = "HTTP_PROXY_BIN", default_value = "mcp-proxy")]
    proxy_bin: String,

    /// Raw tool cache file shared with the admin UI.
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

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    match &handle.fanout {
        Some(fanout) => {
            fanout
                .start_listener(events_tx, cancel.child_token())
                .await
                .context("start command fanout listener")?;
        }
        None => {
            tracing::warn!("store has no pub/sub channel; relying on the poll loop only");
        }
    }

    let ctx = Arc::new(BridgeContext {
        store: handle.store,
        config_path: args.config,
        proxy_bin: args.proxy_bin,
        ws_token: args.ws_token,
        tools_cache: ToolsCacheFile::new(args.tools_cache),
    });

    let reconciler = Reconciler::new(ctx);
    let run = tokio::spawn(reconciler.run(events_rx, cancel.clone()));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    run.await.context("join reconciler")?;

    Ok(())
}
