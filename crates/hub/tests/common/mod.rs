//! Shared helpers for hub integration tests: an in-process hub on an
//! ephemeral port, plus a scripted provider simulator speaking the
//! newline-delimited frame protocol over a real WebSocket.

use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_mcp_hub::admin::AdminState;
use tether_mcp_hub::hub::Hub;
use tether_protocol::Frame;
use tether_store::{MemoryEndpointStore, ToolsCacheFile};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestHub {
    pub addr: SocketAddr,
    pub store: Arc<MemoryEndpointStore>,
    // Held so the cache/config paths stay valid for the test's lifetime.
    _dir: tempfile::TempDir,
}

pub async fn start_hub(ws_token: Option<String>) -> anyhow::Result<TestHub> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryEndpointStore::new());

    let hub = Arc::new(Hub::new(ws_token));
    let admin_state = Arc::new(AdminState {
        store: store.clone(),
        fanout: None,
        tools_cache: ToolsCacheFile::new(dir.path().join("tools_cache.json")),
        config_path: dir.path().join("mcp_config.json"),
        proxy_bin: "mcp-proxy".to_string(),
    });

    let app = tether_mcp_hub::app(hub, admin_state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    tether_test_support::wait_http_ok(
        &format!("http://{addr}/endpoints"),
        Duration::from_secs(10),
    )
    .await?;

    Ok(TestHub {
        addr,
        store,
        _dir: dir,
    })
}

pub async fn connect_frontend(addr: SocketAddr) -> anyhow::Result<WsClient> {
    let (ws, _) = connect_async(format!("ws://{addr}/")).await?;
    Ok(ws)
}

/// Send one frame and await the next text frame, with a timeout.
pub async fn request(ws: &mut WsClient, frame: &Frame) -> anyhow::Result<Frame> {
    ws.send(Message::text(frame.to_line())).await?;
    next_frame(ws).await
}

pub async fn next_frame(ws: &mut WsClient) -> anyhow::Result<Frame> {
    let deadline = Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for frame"))?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
        match message {
            Message::Text(text) => return Ok(Frame::parse(text.as_str())?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => anyhow::bail!("unexpected message: {other:?}"),
        }
    }
}

/// A provider socket that answers the hub's handshake and every
/// `tools/list` with a fixed tool set, and `tools/call` with a canned
/// result. Frames it receives are also recorded for assertions.
pub struct ProviderSim {
    pub calls: tokio::sync::mpsc::UnboundedReceiver<Frame>,
    task: tokio::task::JoinHandle<()>,
}

impl ProviderSim {
    /// Connect and block until the hub's `initialize` request has been
    /// answered, so registration is complete when this returns.
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        tools: Value,
    ) -> anyhow::Result<Self> {
        let (mut ws, _) =
            connect_async(format!("ws://{addr}/mcp?server={name}")).await?;

        // First frame from the hub must be its initialize request.
        let init = next_frame(&mut ws).await?;
        anyhow::ensure!(
            init.method.as_deref() == Some("initialize"),
            "expected initialize, got {:?}",
            init.method
        );
        ws.send(Message::text(
            Frame::response(
                init.id.clone().unwrap_or(Value::Null),
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": name, "version": "0" }
                }),
            )
            .to_line(),
        ))
        .await?;

        let (calls_tx, calls) = tokio::sync::mpsc::unbounded_channel();
        let name = name.to_string();
        let task = tokio::spawn(async move {
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else { continue };
                let Ok(frame) = Frame::parse(text.as_str()) else { continue };

                let reply = match frame.method.as_deref() {
                    Some("tools/list") => Some(Frame::response(
                        frame.id.clone().unwrap_or(Value::Null),
                        json!({ "tools": tools.clone() }),
                    )),
                    Some("tools/call") => Some(Frame::response(
                        frame.id.clone().unwrap_or(Value::Null),
                        json!({
                            "content": [{
                                "type": "text",
                                "text": format!("handled by {name}")
                            }]
                        }),
                    )),
                    _ => None,
                };

                let _ = calls_tx.send(frame);
                if let Some(reply) = reply
                    && ws.send(Message::text(reply.to_line())).await.is_err()
                {
                    break;
                }
            }
        });

        Ok(Self { calls, task })
    }

    /// Next frame the provider received, with a timeout.
    pub async fn recv(&mut self) -> anyhow::Result<Frame> {
        tokio::time::timeout(Duration::from_secs(5), self.calls.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for provider frame"))?
            .ok_or_else(|| anyhow::anyhow!("provider simulator stopped"))
    }

    /// Next `tools/call` the provider received, skipping handshake traffic.
    pub async fn recv_call(&mut self) -> anyhow::Result<Frame> {
        loop {
            let frame = self.recv().await?;
            if frame.method.as_deref() == Some("tools/call") {
                return Ok(frame);
            }
        }
    }
}

impl Drop for ProviderSim {
    fn drop(&mut self) {
        self.task.abort();
    }
}
