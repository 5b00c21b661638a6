//! WebSocket handlers for the two socket roles.

use crate::hub::Hub;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query};
use axum::response::Response;
use futures::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Close code sent when a provider's token is absent or mismatched.
pub const CLOSE_CODE_AUTH: u16 = 4001;

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// `/mcp?server=<name>[&token=<t>]`: inbound bridge connections.
pub async fn provider_ws(
    Extension(hub): Extension<Arc<Hub>>,
    Query(query): Query<ProviderQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| provider_socket(hub, socket, query))
}

/// Default path: end-user frontends.
pub async fn frontend_ws(
    Extension(hub): Extension<Arc<Hub>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| frontend_socket(hub, socket))
}

async fn provider_socket(hub: Arc<Hub>, mut socket: WebSocket, query: ProviderQuery) {
    let name = query.server.unwrap_or_else(|| "unknown".to_string());

    if !hub.token_ok(query.token.as_deref()) {
        tracing::warn!(provider = %name, "provider socket rejected: invalid or missing token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_CODE_AUTH,
                reason: "Invalid or missing token".into(),
            })))
            .await;
        return;
    }

    let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();
    hub.register_provider(&name, tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(provider = %name, "provider frame received");
                        hub.handle_provider_frame(&name, text.as_str());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        hub.handle_provider_frame(&name, &text);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    hub.unregister_provider(&name, &tx);
}

async fn frontend_socket(hub: Arc<Hub>, socket: WebSocket) {
    let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();
    let id = hub.register_frontend(tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        hub.handle_frontend_frame(&tx, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        hub.handle_frontend_frame(&tx, &text).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    hub.unregister_frontend(id);
}
