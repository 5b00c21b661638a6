//! The frame pipe: three concurrent forwarders per bridge.
//!
//! Both sides carry newline-delimited JSON-RPC frames. Frames from the
//! WebSocket are forwarded to the child unchanged (the child is the
//! authoritative parser); frames from the child are dropped when they are
//! not JSON, filtered when they are `tools/list` responses, and forwarded
//! verbatim otherwise. Loss of any forwarder is terminal for the bridge.

use crate::error::BridgeError;
use crate::filter::{IncludeDisabledFlags, ResponseFilter};
use futures::{Sink, SinkExt as _, Stream, StreamExt as _};
use tether_protocol::Frame;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio_tungstenite::tungstenite::Message;

/// Hub-side close code for a rejected provider token.
pub const CLOSE_CODE_AUTH: u16 = 4001;

/// Consume WebSocket messages and write them to the child's stdin.
///
/// `tools/list` requests carrying `params.include_disabled` are recorded by
/// request id so the matching response can skip the disabled-tool filter;
/// the frame itself still goes through untouched.
pub async fn ws_to_child<S, W>(
    mut ws_rx: S,
    mut stdin: W,
    flags: &IncludeDisabledFlags,
    provider: &str,
) -> Result<(), BridgeError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = ws_rx.next().await {
        let message = message.map_err(|e| BridgeError::Socket(e.to_string()))?;
        let text = match message {
            Message::Text(t) => t.to_string(),
            Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            Message::Close(frame) => {
                if let Some(frame) = &frame
                    && u16::from(frame.code) == CLOSE_CODE_AUTH
                {
                    return Err(BridgeError::Auth(frame.reason.to_string()));
                }
                let reason = frame.map_or_else(String::new, |f| f.reason.to_string());
                return Err(BridgeError::Closed(format!(
                    "websocket closed by endpoint: {reason}"
                )));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        if let Ok(frame) = Frame::parse(text.trim())
            && frame.include_disabled()
            && let Some(id) = frame.id_key()
        {
            flags.record(id);
        }

        tracing::debug!(provider = %provider, "<< {}", preview(&text));
        stdin.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
    }

    Err(BridgeError::Closed("websocket stream ended".to_string()))
}

/// Read the child's stdout line by line and send frames to the WebSocket.
///
/// End-of-stream means the child exited.
pub async fn child_to_ws<R, T>(
    stdout: R,
    mut ws_tx: T,
    filter: &ResponseFilter,
    flags: &IncludeDisabledFlags,
    provider: &str,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
    T: Sink<Message> + Unpin,
    T::Error: std::fmt::Display,
{
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(BridgeError::ChildExited("stdout closed".to_string()));
        };
        if line.trim().is_empty() {
            continue;
        }

        let out = match Frame::parse(&line) {
            Err(e) => {
                tracing::debug!(provider = %provider, error = %e, "dropping non-JSON line from child stdout");
                continue;
            }
            Ok(mut frame) => {
                if frame.is_tools_list_response() {
                    let include_disabled =
                        frame.id_key().is_some_and(|id| flags.take(&id));
                    filter.apply(&mut frame, provider, include_disabled).await;
                    frame.to_line()
                } else {
                    line
                }
            }
        };

        tracing::debug!(provider = %provider, ">> {}", preview(&out));
        ws_tx
            .send(Message::text(out))
            .await
            .map_err(|e| BridgeError::Socket(e.to_string()))?;
    }
}

/// Copy the child's stderr to the host's stderr, tagged with the provider.
///
/// Stderr is never parsed as JSON.
pub async fn stderr_to_host<R>(stderr: R, provider: &str) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        eprintln!("[{provider}] {line}");
    }
    Err(BridgeError::ChildExited("stderr closed".to_string()))
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use tether_store::ToolsCacheFile;
    use std::sync::Arc;
    use tether_store::{EndpointStore, MemoryEndpointStore};

    fn message_stream(
        messages: Vec<Message>,
    ) -> impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin {
        futures::stream::iter(messages.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn ws_frames_reach_stdin_newline_terminated() {
        let flags = IncludeDisabledFlags::default();
        let mut stdin: Vec<u8> = Vec::new();

        let result = ws_to_child(
            message_stream(vec![
                Message::text(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#),
                Message::text("{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n"),
            ]),
            &mut stdin,
            &flags,
            "p1",
        )
        .await;

        // Stream end is terminal for the bridge.
        assert!(matches!(result, Err(BridgeError::Closed(_))));

        let written = String::from_utf8(stdin).expect("utf8");
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("tools/list"));
        assert!(written.ends_with('\n'));
    }

    #[tokio::test]
    async fn malformed_ws_frames_are_forwarded_unchanged() {
        let flags = IncludeDisabledFlags::default();
        let mut stdin: Vec<u8> = Vec::new();

        let _ = ws_to_child(
            message_stream(vec![Message::text("definitely not json")]),
            &mut stdin,
            &flags,
            "p1",
        )
        .await;

        assert_eq!(String::from_utf8(stdin).expect("utf8"), "definitely not json\n");
    }

    #[tokio::test]
    async fn auth_close_code_maps_to_auth_error() {
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

        let flags = IncludeDisabledFlags::default();
        let mut stdin: Vec<u8> = Vec::new();

        let result = ws_to_child(
            message_stream(vec![Message::Close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_CODE_AUTH),
                reason: "Invalid or missing token".into(),
            }))]),
            &mut stdin,
            &flags,
            "p1",
        )
        .await;

        assert!(matches!(result, Err(BridgeError::Auth(_))));
    }

    #[tokio::test]
    async fn include_disabled_request_is_tracked_for_the_response() {
        let flags = IncludeDisabledFlags::default();
        let mut stdin: Vec<u8> = Vec::new();

        let _ = ws_to_child(
            message_stream(vec![Message::text(
                r#"{"jsonrpc":"2.0","id":"adm1","method":"tools/list","params":{"include_disabled":true}}"#,
            )]),
            &mut stdin,
            &flags,
            "p1",
        )
        .await;

        assert!(flags.take("adm1"));
    }

    #[tokio::test]
    async fn child_stdout_noise_is_dropped_and_frames_forwarded() {
        let store = Arc::new(MemoryEndpointStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let filter = ResponseFilter::new(store, ToolsCacheFile::new(dir.path().join("cache.json")));
        let flags = IncludeDisabledFlags::default();

        let stdout: &[u8] = b"starting up...\n{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{\"ok\":true}}\n";
        let (tx, mut rx) = mpsc::unbounded::<Message>();

        let result = child_to_ws(stdout, tx, &filter, &flags, "p1").await;
        assert!(matches!(result, Err(BridgeError::ChildExited(_))));

        let sent = rx.try_next().expect("one frame").expect("message");
        assert!(sent.into_text().expect("text").contains("\"id\":5"));
        assert!(rx.try_next().expect("closed").is_none(), "noise line must not be forwarded");
    }

    #[tokio::test]
    async fn tools_list_responses_are_filtered_in_flight() {
        let store = Arc::new(MemoryEndpointStore::new());
        store.set_tool_enabled("p1", "echo", false).await.expect("set");

        let dir = tempfile::tempdir().expect("tempdir");
        let filter = ResponseFilter::new(store, ToolsCacheFile::new(dir.path().join("cache.json")));
        let flags = IncludeDisabledFlags::default();

        let stdout: &[u8] =
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[{\"name\":\"echo\",\"description\":\"echoes\"}]}}\n";
        let (tx, mut rx) = mpsc::unbounded::<Message>();

        let _ = child_to_ws(stdout, tx, &filter, &flags, "p1").await;

        let sent = rx.try_next().expect("one frame").expect("message");
        let frame = Frame::parse(&sent.into_text().expect("text")).expect("frame");
        assert_eq!(frame.tools().map(Vec::len), Some(0));
    }
}
