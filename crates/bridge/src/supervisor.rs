//! Per-(endpoint, provider) bridge supervision.
//!
//! Each bridge runs an infinite reconnection loop: connect the WebSocket,
//! spawn the provider child, run the three frame-pipe forwarders until one
//! fails, tear everything down, back off, repeat. The loop ends only on
//! cancellation from the reconciler or on an authentication rejection.

use crate::error::BridgeError;
use crate::filter::{IncludeDisabledFlags, ResponseFilter};
use crate::pipe;
use futures::StreamExt as _;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tether_config::{LaunchPlan, spawn_provider};
use tether_store::{ConnectionStatus, EndpointRef, EndpointStore, ToolsCacheFile};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);
const CHILD_GRACE: Duration = Duration::from_secs(5);

/// Shared dependencies for every bridge in this host process.
pub struct BridgeContext {
    pub store: Arc<dyn EndpointStore>,
    pub config_path: PathBuf,
    pub proxy_bin: String,
    pub ws_token: Option<String>,
    pub tools_cache: ToolsCacheFile,
}

/// Next reconnection delay: doubling, capped at ten minutes.
#[must_use]
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Resolve the dial URL for one bridge.
///
/// A URL without a path gets `/mcp` appended (a common configuration
/// mistake), then `server=` and optionally `token=` query parameters.
pub fn dial_url(
    endpoint_url: &str,
    provider: &str,
    token: Option<&str>,
) -> Result<url::Url, BridgeError> {
    let mut url = url::Url::parse(endpoint_url)
        .map_err(|e| BridgeError::Socket(format!("invalid endpoint URL '{endpoint_url}': {e}")))?;

    if url.path().is_empty() || url.path() == "/" {
        tracing::warn!(url = %endpoint_url, "endpoint URL missing '/mcp' path; appending");
        url.set_path("/mcp");
    }

    url.query_pairs_mut().append_pair("server", provider);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

enum SessionEnd {
    Cancelled,
    /// The endpoint rejected our token. Not retryable.
    Auth(String),
    Failed {
        /// Whether the WebSocket opened before the failure; an opened
        /// session resets the backoff.
        opened: bool,
        message: String,
    },
}

/// Run one bridge until cancelled or permanently rejected.
pub async fn run_bridge(
    ctx: Arc<BridgeContext>,
    endpoint: EndpointRef,
    provider: String,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt: u64 = 0;

    loop {
        if attempt > 0 {
            tracing::info!(
                endpoint = %endpoint.name,
                provider = %provider,
                wait_secs = backoff.as_secs(),
                attempt,
                "waiting before reconnection"
            );
            let _ = ctx
                .store
                .update_status(endpoint.id, ConnectionStatus::Disconnected, None)
                .await;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(backoff) => {}
            }
        }
        attempt += 1;

        match run_session(&ctx, &endpoint, &provider, &cancel).await {
            SessionEnd::Cancelled => {
                let _ = ctx
                    .store
                    .update_status(endpoint.id, ConnectionStatus::Disconnected, None)
                    .await;
                break;
            }
            SessionEnd::Auth(message) => {
                tracing::warn!(
                    endpoint = %endpoint.name,
                    provider = %provider,
                    message = %message,
                    "endpoint rejected credentials; not retrying this bridge"
                );
                let _ = ctx
                    .store
                    .update_status(endpoint.id, ConnectionStatus::Error, Some(&message))
                    .await;
                break;
            }
            SessionEnd::Failed { opened, message } => {
                tracing::warn!(
                    endpoint = %endpoint.name,
                    provider = %provider,
                    message = %message,
                    "bridge session ended"
                );
                let _ = ctx
                    .store
                    .update_status(endpoint.id, ConnectionStatus::Error, Some(&message))
                    .await;
                backoff = if opened {
                    INITIAL_BACKOFF
                } else {
                    next_backoff(backoff)
                };
            }
        }
    }

    tracing::info!(endpoint = %endpoint.name, provider = %provider, "bridge stopped");
}

async fn run_session(
    ctx: &BridgeContext,
    endpoint: &EndpointRef,
    provider: &str,
    cancel: &CancellationToken,
) -> SessionEnd {
    let ws_url = match dial_url(&endpoint.url, provider, ctx.ws_token.as_deref()) {
        Ok(u) => u,
        Err(e) => {
            return SessionEnd::Failed {
                opened: false,
                message: e.to_string(),
            };
        }
    };

    tracing::info!(endpoint = %endpoint.name, provider = %provider, "connecting to WebSocket endpoint");
    let _ = ctx
        .store
        .update_status(endpoint.id, ConnectionStatus::Connecting, None)
        .await;

    let ws = tokio::select! {
        () = cancel.cancelled() => return SessionEnd::Cancelled,
        res = tokio_tungstenite::connect_async(ws_url.as_str()) => match res {
            Ok((ws, _response)) => ws,
            Err(e) => return classify_connect_error(&e),
        }
    };

    tracing::info!(endpoint = %endpoint.name, provider = %provider, "connected to WebSocket endpoint");
    let _ = ctx
        .store
        .update_status(endpoint.id, ConnectionStatus::Connected, None)
        .await;

    // Build the child per attempt so config edits (args, env) take effect on
    // the next reconnect without a reconciler pass.
    let config = match tether_config::load_config(&ctx.config_path) {
        Ok(c) => c,
        Err(e) => {
            return SessionEnd::Failed {
                opened: true,
                message: format!("config error: {e}"),
            };
        }
    };
    let Some(spec) = config.get(provider) else {
        return SessionEnd::Failed {
            opened: true,
            message: format!("provider '{provider}' not present in config"),
        };
    };
    let plan = match LaunchPlan::build(provider, spec, &ctx.proxy_bin) {
        Ok(p) => p,
        Err(e) => {
            return SessionEnd::Failed {
                opened: true,
                message: e.to_string(),
            };
        }
    };

    let mut child = match spawn_provider(&plan) {
        Ok(c) => c,
        Err(e) => {
            return SessionEnd::Failed {
                opened: true,
                message: format!("failed to spawn provider: {e}"),
            };
        }
    };
    tracing::info!(
        endpoint = %endpoint.name,
        provider = %provider,
        command = %plan.program,
        "started provider process"
    );

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = shutdown_child(child, provider).await;
        return SessionEnd::Failed {
            opened: true,
            message: "provider child is missing a stdio handle".to_string(),
        };
    };

    let (ws_tx, ws_rx) = ws.split();
    let flags = IncludeDisabledFlags::default();
    let filter = ResponseFilter::new(ctx.store.clone(), ctx.tools_cache.clone());

    // The first forwarder to fail wins the select, which drops (cancels) the
    // other two before the child is torn down.
    let error = tokio::select! {
        () = cancel.cancelled() => BridgeError::Cancelled,
        r = pipe::ws_to_child(ws_rx, stdin, &flags, provider) => {
            r.err().unwrap_or_else(|| BridgeError::Closed("ws-to-child pipe ended".to_string()))
        }
        r = pipe::child_to_ws(stdout, ws_tx, &filter, &flags, provider) => {
            r.err().unwrap_or_else(|| BridgeError::Closed("child-to-ws pipe ended".to_string()))
        }
        r = pipe::stderr_to_host(stderr, provider) => {
            r.err().unwrap_or_else(|| BridgeError::Closed("stderr pipe ended".to_string()))
        }
    };

    let exit_status = shutdown_child(child, provider).await;

    match error {
        BridgeError::Cancelled => SessionEnd::Cancelled,
        BridgeError::Auth(message) => SessionEnd::Auth(message),
        BridgeError::ChildExited(message) => {
            let message = match exit_status {
                Some(status) => format!("provider exited: {status}"),
                None => format!("provider exited: {message}"),
            };
            SessionEnd::Failed {
                opened: true,
                message,
            }
        }
        other => SessionEnd::Failed {
            opened: true,
            message: other.to_string(),
        },
    }
}

fn classify_connect_error(e: &tokio_tungstenite::tungstenite::Error) -> SessionEnd {
    use tokio_tungstenite::tungstenite::Error;

    if let Error::Http(response) = e {
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return SessionEnd::Auth(format!("handshake rejected with HTTP {status}"));
        }
    }
    SessionEnd::Failed {
        opened: false,
        message: format!("websocket connect failed: {e}"),
    }
}

/// Terminate the child: SIGTERM to its process group, a 5s grace, then kill.
async fn shutdown_child(mut child: Child, provider: &str) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    tracing::info!(provider = %provider, "terminating provider process");
    signal_child(&child, false);

    match tokio::time::timeout(CHILD_GRACE, child.wait()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            tracing::warn!(provider = %provider, "provider ignored terminate; killing");
            signal_child(&child, true);
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn signal_child(child: &Child, kill: bool) {
    let Some(pid) = child.id() else { return };
    let sig = if kill { libc::SIGKILL } else { libc::SIGTERM };
    // The child was spawned as a process-group leader; a negative pid
    // signals the whole group so grandchildren are reaped too.
    unsafe {
        libc::kill(-(pid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_child(child: &Child, _kill: bool) {
    // No graceful signal on this platform; Child::start_kill terminates.
    let _ = child;
}
