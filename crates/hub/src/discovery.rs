//! On-demand tool discovery for the admin API.
//!
//! `/mcp-tools/refresh` spawns the provider the same way the bridge would,
//! performs the `initialize` → `tools/list` handshake over stdio, caches
//! the raw list, and tears the process down.

use anyhow::Context as _;
use serde_json::{Value, json};
use std::time::Duration;
use tether_config::{LaunchPlan, ProviderSpec, spawn_provider};
use tether_protocol::{Frame, methods};
use tether_store::ToolsCacheFile;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe one provider and cache its raw tool list. Disabled providers are
/// skipped with an empty result.
pub async fn discover_provider_tools(
    name: &str,
    spec: &ProviderSpec,
    proxy_bin: &str,
    cache: &ToolsCacheFile,
) -> anyhow::Result<Vec<Value>> {
    if spec.disabled {
        tracing::info!(provider = %name, "skipping tool discovery for disabled provider");
        return Ok(Vec::new());
    }

    let plan = LaunchPlan::build(name, spec, proxy_bin)
        .with_context(|| format!("build launch plan for '{name}'"))?;
    let mut child = spawn_provider(&plan).with_context(|| format!("spawn provider '{name}'"))?;

    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, probe(&mut child, name)).await;

    let _ = child.start_kill();
    let _ = child.wait().await;

    match result {
        Ok(Ok(tools)) => {
            cache
                .put(name, tools.clone())
                .with_context(|| format!("cache tools for '{name}'"))?;
            tracing::info!(provider = %name, tools = tools.len(), "discovered tools");
            Ok(tools)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => anyhow::bail!("provider '{name}' did not answer within {HANDSHAKE_TIMEOUT:?}"),
    }
}

async fn probe(child: &mut tokio::process::Child, name: &str) -> anyhow::Result<Vec<Value>> {
    let mut stdin = child.stdin.take().context("child stdin")?;
    let stdout = child.stdout.take().context("child stdout")?;
    let mut lines = BufReader::new(stdout).lines();

    let init = Frame::request(
        "admin_init",
        methods::INITIALIZE,
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "Tether Admin Tool Discovery", "version": env!("CARGO_PKG_VERSION") }
        }),
    );
    stdin.write_all(init.to_line().as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;

    let response = read_response(&mut lines, "admin_init").await?;
    if response.error.is_some() {
        anyhow::bail!("provider '{name}' initialize failed: {:?}", response.error);
    }

    let list = Frame::request("admin_tools", methods::TOOLS_LIST, json!({}));
    stdin.write_all(list.to_line().as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;

    let response = read_response(&mut lines, "admin_tools").await?;
    if let Some(error) = response.error {
        anyhow::bail!("provider '{name}' tools/list failed: {error}");
    }
    Ok(response.tools().cloned().unwrap_or_default())
}

/// Read lines until one parses as a frame answering `id`, skipping any
/// startup noise a provider prints to stdout.
async fn read_response(
    lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    id: &str,
) -> anyhow::Result<Frame> {
    loop {
        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("provider exited before answering '{id}'");
        };
        let Ok(frame) = Frame::parse(&line) else {
            continue;
        };
        if frame.id_key().as_deref() == Some(id) {
            return Ok(frame);
        }
    }
}
