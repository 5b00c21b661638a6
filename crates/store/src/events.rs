//! Control-plane fanout over Postgres LISTEN/NOTIFY.
//!
//! The admin API publishes endpoint lifecycle events here; every bridge host
//! subscribes. Delivery is best-effort: subscribers also poll the store, so
//! a missed notification only delays convergence by one poll interval.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Well-known pub/sub topic for endpoint lifecycle commands.
pub const COMMANDS_CHANNEL: &str = "mcp-commands";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointAction {
    Connect,
    Disconnect,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
    pub id: i64,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEvent {
    pub action: EndpointAction,
    pub endpoint: EndpointRef,
}

/// On-channel payload: the event plus the publishing node, so a process that
/// both publishes and subscribes can skip its own traffic.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
    #[serde(flatten)]
    event: EndpointEvent,
}

#[derive(Clone)]
pub struct CommandFanout {
    pool: PgPool,
    node_id: String,
}

impl CommandFanout {
    #[must_use]
    pub fn new(pool: PgPool, node_id: String) -> Self {
        Self { pool, node_id }
    }

    /// Publish one event to every subscriber.
    pub async fn publish(&self, event: &EndpointEvent) -> anyhow::Result<()> {
        let wire = WireEvent {
            origin: Some(self.node_id.clone()),
            event: event.clone(),
        };
        let payload = serde_json::to_string(&wire).expect("valid json");
        sqlx::query("select pg_notify($1, $2)")
            .bind(COMMANDS_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("pg_notify")?;
        Ok(())
    }

    /// Subscribe and forward events into `tx` until shutdown.
    ///
    /// Events published by this node are skipped. A receive error ends the
    /// listener rather than spinning; the caller's poll loop covers the gap.
    pub async fn start_listener(
        &self,
        tx: mpsc::UnboundedSender<EndpointEvent>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("connect PgListener")?;
        listener
            .listen(COMMANDS_CHANNEL)
            .await
            .with_context(|| format!("LISTEN {COMMANDS_CHANNEL}"))?;

        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::info!("command fanout listener shutting down");
                        break;
                    }
                    res = listener.recv() => {
                        let notification = match res {
                            Ok(n) => n,
                            Err(e) => {
                                tracing::warn!(error = %e, "command fanout recv error");
                                break;
                            }
                        };

                        let payload = notification.payload();
                        let wire: WireEvent = match serde_json::from_str(payload) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(error = %e, payload = %payload, "invalid command fanout payload");
                                continue;
                            }
                        };

                        if wire.origin.as_deref() == Some(node_id.as_str()) {
                            continue;
                        }
                        if tx.send(wire.event).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }
}
