//! Full-stack bridge test: a real hub (in process), a real reconciler, a
//! real echo provider child, and a frontend WebSocket client.

use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tether_mcp_bridge::reconcile::Reconciler;
use tether_mcp_bridge::supervisor::BridgeContext;
use tether_mcp_hub::admin::AdminState;
use tether_mcp_hub::hub::Hub;
use tether_protocol::Frame;
use tether_store::{ConnectionStatus, EndpointStore as _, MemoryEndpointStore, ToolsCacheFile};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn round_trip(ws: &mut WsClient, frame: &Frame) -> anyhow::Result<Frame> {
    ws.send(Message::text(frame.to_line())).await?;
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for response"))?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
        match message {
            Message::Text(text) => return Ok(Frame::parse(text.as_str())?),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn bridge_tunnels_echo_provider_to_frontend() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    // Provider config pointing at the echo test server.
    let config_path = dir.path().join("mcp_config.json");
    let config = json!({
        "mcpServers": {
            "P1": { "command": env!("CARGO_BIN_EXE_tether-echo-provider") }
        }
    });
    std::fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    // One store shared by the hub's admin surface and the bridge host.
    let store = Arc::new(MemoryEndpointStore::new());
    let tools_cache = ToolsCacheFile::new(dir.path().join("tools_cache.json"));

    // In-process hub on an ephemeral port.
    let hub = Arc::new(Hub::new(None));
    let admin_state = Arc::new(AdminState {
        store: store.clone(),
        fanout: None,
        tools_cache: tools_cache.clone(),
        config_path: config_path.clone(),
        proxy_bin: "mcp-proxy".to_string(),
    });
    let app = tether_mcp_hub::app(hub, admin_state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    // Seed the endpoint with a bare host URL: the supervisor must append
    // `/mcp` before dialing.
    let (endpoint, _) = store
        .upsert_endpoint("E1", &format!("ws://{addr}"), true)
        .await?;

    let ctx = Arc::new(BridgeContext {
        store: store.clone(),
        config_path,
        proxy_bin: "mcp-proxy".to_string(),
        ws_token: None,
        tools_cache,
    });
    let cancel = CancellationToken::new();
    let (_events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let reconciler = tokio::spawn(Reconciler::new(ctx).run(events_rx, cancel.clone()));

    // Frontend sees the echo tool once the bridge is up.
    let (mut frontend, _) = connect_async(format!("ws://{addr}/")).await?;
    let mut tools: Vec<Value> = Vec::new();
    for attempt in 0..50u64 {
        let list = round_trip(
            &mut frontend,
            &Frame::request(attempt, "tools/list", json!({})),
        )
        .await?;
        tools = list.tools().cloned().unwrap_or_default();
        if !tools.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(tools.len(), 1, "echo tool should appear within the deadline");
    assert_eq!(tools[0]["name"], json!("echo"));
    assert_eq!(tools[0]["description"], json!("[P1] echoes"));

    // The supervisor reported the connection into the store.
    let seen = store.get_endpoint(endpoint.id).await?.expect("endpoint");
    assert_eq!(seen.connection_status, ConnectionStatus::Connected);
    assert!(seen.last_connected_at.is_some());

    // A call round-trips through hub → bridge → child and back.
    let call = round_trip(
        &mut frontend,
        &Frame::request(
            1000,
            "tools/call",
            json!({"name": "echo", "arguments": {"text": "ping pong"}}),
        ),
    )
    .await?;
    assert_eq!(call.id, Some(json!(1000)));
    assert_eq!(
        call.result.expect("result")["content"][0]["text"],
        json!("ping pong")
    );

    // Disable the tool: the filtered surface goes empty, but the
    // include_disabled flag still reveals it.
    store.set_tool_enabled("P1", "echo", false).await?;
    let list = round_trip(
        &mut frontend,
        &Frame::request(2000, "tools/list", json!({})),
    )
    .await?;
    assert_eq!(list.tools().map(Vec::len), Some(0));

    let list = round_trip(
        &mut frontend,
        &Frame::request(2001, "tools/list", json!({"include_disabled": true})),
    )
    .await?;
    assert_eq!(list.tools().map(Vec::len), Some(1));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), reconciler).await;
    Ok(())
}
