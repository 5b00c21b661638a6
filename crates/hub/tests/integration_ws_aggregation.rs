mod common;

use common::{ProviderSim, connect_frontend, next_frame, request, start_hub};
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tether_protocol::Frame;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn single_provider_round_trip() -> anyhow::Result<()> {
    let hub = start_hub(None).await?;
    let _provider = ProviderSim::connect(
        hub.addr,
        "P1",
        json!([{
            "name": "echo",
            "description": "echoes",
            "inputSchema": { "type": "object" }
        }]),
    )
    .await?;

    let mut frontend = connect_frontend(hub.addr).await?;

    // The hub answers initialize itself; nothing reaches the provider.
    let init = request(
        &mut frontend,
        &Frame::request(1, "initialize", json!({"protocolVersion": "2024-11-05"})),
    )
    .await?;
    let result = init.result.expect("initialize result");
    assert_eq!(result["serverInfo"]["name"], json!("Tether Hub"));

    frontend
        .send(Message::text(
            Frame::notification("notifications/initialized", json!({})).to_line(),
        ))
        .await?;

    let list = request(&mut frontend, &Frame::request(2, "tools/list", json!({}))).await?;
    assert_eq!(list.id, Some(json!(2)));
    let tools = list.tools().expect("tools array");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], json!("echo"));
    assert_eq!(tools[0]["description"], json!("[P1] echoes"));
    assert_eq!(tools[0]["inputSchema"]["type"], json!("object"));

    let call = request(
        &mut frontend,
        &Frame::request(3, "tools/call", json!({"name": "echo", "arguments": {"text": "hi"}})),
    )
    .await?;
    assert_eq!(call.id, Some(json!(3)));
    assert_eq!(
        call.result.expect("call result")["content"][0]["text"],
        json!("handled by P1")
    );

    Ok(())
}

#[tokio::test]
async fn name_conflict_prefixes_and_routes() -> anyhow::Result<()> {
    let hub = start_hub(None).await?;
    let mut p1 = ProviderSim::connect(
        hub.addr,
        "P1",
        json!([{ "name": "search", "description": "web search" }]),
    )
    .await?;
    let mut p2 = ProviderSim::connect(
        hub.addr,
        "P2",
        json!([{ "name": "search", "description": "code search" }]),
    )
    .await?;

    let mut frontend = connect_frontend(hub.addr).await?;
    let list = request(&mut frontend, &Frame::request(1, "tools/list", json!({}))).await?;
    let tools = list.tools().expect("tools array");
    let names: Vec<&str> = tools
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, vec!["search", "P2.search"]);
    assert_eq!(tools[0]["description"], json!("[P1] web search"));
    assert_eq!(tools[1]["description"], json!("[P2] code search"));

    // The prefixed name routes to P2 and only P2.
    let call = request(
        &mut frontend,
        &Frame::request(2, "tools/call", json!({"name": "P2.search", "arguments": {}})),
    )
    .await?;
    assert_eq!(call.id, Some(json!(2)));

    let routed = p2.recv_call().await?;
    assert_eq!(routed.tool_call_name(), Some("P2.search"));

    // P1 saw handshake and refresh traffic, but never a call.
    while let Ok(frame) = p1.calls.try_recv() {
        assert_ne!(frame.method.as_deref(), Some("tools/call"));
    }

    Ok(())
}

#[tokio::test]
async fn unknown_tool_gets_method_not_found() -> anyhow::Result<()> {
    let hub = start_hub(None).await?;
    let mut frontend = connect_frontend(hub.addr).await?;

    let response = request(
        &mut frontend,
        &Frame::request(7, "tools/call", json!({"name": "nonexistent"})),
    )
    .await?;
    assert_eq!(response.id, Some(json!(7)));
    assert_eq!(response.error.expect("error")["code"], json!(-32601));

    Ok(())
}

#[tokio::test]
async fn provider_disconnect_empties_the_surface() -> anyhow::Result<()> {
    let hub = start_hub(None).await?;
    let provider = ProviderSim::connect(
        hub.addr,
        "P1",
        json!([{ "name": "echo", "description": "echoes" }]),
    )
    .await?;

    let mut frontend = connect_frontend(hub.addr).await?;
    let list = request(&mut frontend, &Frame::request(1, "tools/list", json!({}))).await?;
    assert_eq!(list.tools().map(Vec::len), Some(1));

    drop(provider);

    // The refresh finds no providers; the aggregated surface is empty.
    let mut last_len = usize::MAX;
    for attempt in 0..10 {
        let list = request(
            &mut frontend,
            &Frame::request(100 + attempt, "tools/list", json!({})),
        )
        .await?;
        last_len = list.tools().map(Vec::len).unwrap_or(usize::MAX);
        if last_len == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert_eq!(last_len, 0);

    Ok(())
}

#[tokio::test]
async fn provider_with_bad_token_is_closed_4001() -> anyhow::Result<()> {
    let hub = start_hub(Some("s3cr3t".to_string())).await?;

    let (mut ws, _) =
        connect_async(format!("ws://{}/mcp?server=P1&token=wrong", hub.addr)).await?;
    let message = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
        .await?
        .expect("a frame")?;
    match message {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4001);
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    // The right token is admitted and greeted with initialize.
    let (mut ws, _) =
        connect_async(format!("ws://{}/mcp?server=P1&token=s3cr3t", hub.addr)).await?;
    let greeting = next_frame(&mut ws).await?;
    assert_eq!(greeting.method.as_deref(), Some("initialize"));

    Ok(())
}

#[tokio::test]
async fn uninterpreted_methods_are_forwarded_or_rejected() -> anyhow::Result<()> {
    let hub = start_hub(None).await?;
    let mut frontend = connect_frontend(hub.addr).await?;

    // With no providers connected the hub answers with an error itself.
    let response = request(
        &mut frontend,
        &Frame::request(1, "resources/list", json!({})),
    )
    .await?;
    assert_eq!(response.error.expect("error")["code"], json!(-32000));

    // With a provider connected the same frame is forwarded verbatim.
    let mut provider = ProviderSim::connect(hub.addr, "P1", Value::Array(vec![])).await?;
    frontend
        .send(Message::text(
            Frame::request(2, "resources/list", json!({})).to_line(),
        ))
        .await?;
    loop {
        let frame = provider.recv().await?;
        if frame.method.as_deref() == Some("resources/list") {
            assert_eq!(frame.id, Some(json!(2)));
            break;
        }
    }

    Ok(())
}
