//! Hub state: socket registries, the per-provider tool cache, and the
//! display-name routing registry.
//!
//! All shared maps live behind parking_lot locks and are only touched from
//! synchronous sections; socket writes go through per-connection unbounded
//! senders, so no lock is ever held across an await.

use axum::extract::ws::Message;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_protocol::{Frame, error_codes, methods};
use tokio::sync::{mpsc, oneshot};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// Ceiling on the pre-aggregation provider refresh; partial results are
/// returned on timeout.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(3);

pub type FrameSender = mpsc::UnboundedSender<Message>;

pub struct Hub {
    ws_token: Option<String>,
    frontends: RwLock<HashMap<u64, FrameSender>>,
    next_frontend_id: AtomicU64,
    providers: RwLock<HashMap<String, FrameSender>>,
    /// Connection order; aggregation iterates this so conflict resolution is
    /// stable first-come-first-served.
    provider_order: RwLock<Vec<String>>,
    provider_tools: RwLock<HashMap<String, Vec<Value>>>,
    /// display name → owning provider.
    registry: RwLock<HashMap<String, String>>,
    pending_refresh: Mutex<HashMap<String, oneshot::Sender<()>>>,
    refresh_counter: AtomicU64,
}

impl Hub {
    #[must_use]
    pub fn new(ws_token: Option<String>) -> Self {
        Self {
            ws_token,
            frontends: RwLock::new(HashMap::new()),
            next_frontend_id: AtomicU64::new(1),
            providers: RwLock::new(HashMap::new()),
            provider_order: RwLock::new(Vec::new()),
            provider_tools: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
            pending_refresh: Mutex::new(HashMap::new()),
            refresh_counter: AtomicU64::new(0),
        }
    }

    /// Validate a provider socket's token. No token configured means open.
    #[must_use]
    pub fn token_ok(&self, provided: Option<&str>) -> bool {
        match &self.ws_token {
            None => true,
            Some(expected) => provided == Some(expected.as_str()),
        }
    }

    // ── frontend sockets ─────────────────────────────────────────────────

    pub fn register_frontend(&self, tx: FrameSender) -> u64 {
        let id = self.next_frontend_id.fetch_add(1, Ordering::Relaxed);
        self.frontends.write().insert(id, tx);
        tracing::info!(total = self.frontends.read().len(), "frontend connected");
        id
    }

    pub fn unregister_frontend(&self, id: u64) {
        self.frontends.write().remove(&id);
        tracing::info!(total = self.frontends.read().len(), "frontend disconnected");
    }

    // ── provider sockets ─────────────────────────────────────────────────

    /// Admit a provider socket and start the handshake: `initialize`, then
    /// (on success) `notifications/initialized` and `tools/list`. None of
    /// these hub-issued exchanges are forwarded to frontends.
    pub fn register_provider(&self, name: &str, tx: FrameSender) {
        {
            let mut providers = self.providers.write();
            let mut order = self.provider_order.write();
            if providers.insert(name.to_string(), tx.clone()).is_none() {
                order.push(name.to_string());
            }
        }
        tracing::info!(provider = %name, "provider connected");

        let init = Frame::request(
            format!("hub_init_{name}"),
            methods::INITIALIZE,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "Tether Hub", "version": env!("CARGO_PKG_VERSION") }
            }),
        );
        let _ = tx.send(text_message(&init));
    }

    /// Remove a provider socket and prune every tool it owned.
    ///
    /// Guarded by channel identity: if a newer socket already took over the
    /// name, the old socket's teardown leaves it alone.
    pub fn unregister_provider(&self, name: &str, tx: &FrameSender) {
        {
            let mut providers = self.providers.write();
            match providers.get(name) {
                Some(current) if current.same_channel(tx) => {
                    providers.remove(name);
                }
                _ => return,
            }
            self.provider_order.write().retain(|n| n != name);
        }
        self.provider_tools.write().remove(name);
        self.registry.write().retain(|_, owner| owner != name);
        tracing::info!(provider = %name, "provider disconnected");
    }

    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.provider_order.read().clone()
    }

    // ── provider frames ──────────────────────────────────────────────────

    /// Handle one frame arriving on a provider socket.
    ///
    /// Handshake and refresh responses are consumed; everything else —
    /// including text that does not parse as JSON — is forwarded to all
    /// connected frontends.
    pub fn handle_provider_frame(&self, provider: &str, text: &str) {
        let Ok(frame) = Frame::parse(text) else {
            self.broadcast_to_frontends(text);
            return;
        };
        let id = frame.id_key().unwrap_or_default();

        if id == format!("hub_init_{provider}") {
            if frame.error.is_some() {
                tracing::warn!(
                    provider = %provider,
                    "provider initialize failed; tools will not be admitted"
                );
            } else if frame.result.is_some() {
                tracing::info!(provider = %provider, "provider initialized");
                self.send_to_provider(
                    provider,
                    &Frame::notification(methods::INITIALIZED, json!({})),
                );
                self.send_to_provider(
                    provider,
                    &Frame::request(
                        format!("hub_tools_{provider}"),
                        methods::TOOLS_LIST,
                        json!({}),
                    ),
                );
            }
            return;
        }

        if frame.is_tools_list_response() {
            if let Some(tools) = frame.tools() {
                self.cache_provider_tools(provider, tools.clone());
            }
            if !id.is_empty()
                && let Some(done) = self.pending_refresh.lock().remove(&id)
            {
                let _ = done.send(());
            }
            if is_hub_issued_id(&id) {
                return;
            }
        }

        self.broadcast_to_frontends(text);
    }

    fn cache_provider_tools(&self, provider: &str, tools: Vec<Value>) {
        {
            let mut registry = self.registry.write();
            for tool in &tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                match registry.get(name) {
                    // Another provider got here first; the aggregation pass
                    // will register this one under its prefixed name.
                    Some(owner) if owner != provider => {}
                    _ => {
                        registry.insert(name.to_string(), provider.to_string());
                    }
                }
            }
        }
        let count = tools.len();
        self.provider_tools
            .write()
            .insert(provider.to_string(), tools);
        tracing::info!(provider = %provider, tools = count, "cached provider tools");
    }

    // ── frontend frames ──────────────────────────────────────────────────

    /// Handle one frame arriving on a frontend socket.
    pub async fn handle_frontend_frame(&self, tx: &FrameSender, text: &str) {
        let Ok(frame) = Frame::parse(text) else {
            self.forward_to_all_providers(tx, text);
            return;
        };

        match frame.method.as_deref() {
            Some(methods::INITIALIZE) => {
                // Providers were initialized when they connected; answer
                // locally as the one logical server.
                let requested = frame
                    .params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .unwrap_or(PROTOCOL_VERSION);
                let response = Frame::response(
                    frame.id.clone().unwrap_or(Value::Null),
                    json!({
                        "protocolVersion": requested,
                        "capabilities": { "tools": {} },
                        "serverInfo": { "name": "Tether Hub", "version": env!("CARGO_PKG_VERSION") }
                    }),
                );
                let _ = tx.send(text_message(&response));
            }
            Some(methods::INITIALIZED) => {
                // Frontend acknowledgment; absorbed.
            }
            Some(methods::TOOLS_LIST) => {
                let params = frame.params.clone().unwrap_or_else(|| json!({}));
                self.refresh_all_tools(params).await;
                let tools = self.aggregate_tools();
                tracing::info!(count = tools.len(), "returning aggregated tools to frontend");
                let response = Frame::response(
                    frame.id.clone().unwrap_or(Value::Null),
                    json!({ "tools": tools }),
                );
                let _ = tx.send(text_message(&response));
            }
            Some(methods::TOOLS_CALL) => {
                let Some(name) = frame.tool_call_name().map(str::to_string) else {
                    let _ = tx.send(text_message(&Frame::error_response(
                        frame.id.clone(),
                        error_codes::METHOD_NOT_FOUND,
                        "Tool not found",
                    )));
                    return;
                };
                self.route_tool_call(tx, &frame, &name, text);
            }
            _ => self.forward_to_all_providers(tx, text),
        }
    }

    fn route_tool_call(&self, tx: &FrameSender, frame: &Frame, name: &str, text: &str) {
        let owner = self.registry.read().get(name).cloned();
        let provider_tx =
            owner.and_then(|owner| self.providers.read().get(&owner).cloned());

        match provider_tx {
            Some(provider_tx) => {
                tracing::info!(tool = %name, "routing tools/call");
                if provider_tx.send(Message::Text(text.to_string().into())).is_err() {
                    let _ = tx.send(text_message(&Frame::error_response(
                        frame.id.clone(),
                        error_codes::PROVIDER_UNAVAILABLE,
                        "Provider disconnected",
                    )));
                }
            }
            None => {
                tracing::warn!(tool = %name, "tool not found in registry");
                let _ = tx.send(text_message(&Frame::error_response(
                    frame.id.clone(),
                    error_codes::METHOD_NOT_FOUND,
                    &format!("Tool '{name}' not found"),
                )));
            }
        }
    }

    // ── tool surface ─────────────────────────────────────────────────────

    /// Re-request `tools/list` from every connected provider with fresh ids,
    /// so the bridges apply their latest filter state. `params` carries the
    /// frontend's request params through (notably `include_disabled`).
    pub async fn refresh_all_tools(&self, params: Value) {
        let providers: Vec<(String, FrameSender)> = {
            let providers = self.providers.read();
            let order = self.provider_order.read();
            order
                .iter()
                .filter_map(|name| providers.get(name).map(|tx| (name.clone(), tx.clone())))
                .collect()
        };
        if providers.is_empty() {
            return;
        }

        // Drop the cache so stale tools cannot outlive this refresh.
        self.provider_tools.write().clear();
        self.registry.write().clear();

        let mut waiters = Vec::new();
        for (name, tx) in providers {
            let id = format!(
                "refresh_tools_{}_{}",
                name,
                self.refresh_counter.fetch_add(1, Ordering::Relaxed)
            );
            let (done_tx, done_rx) = oneshot::channel();
            self.pending_refresh.lock().insert(id.clone(), done_tx);

            let request = Frame::request(id.clone(), methods::TOOLS_LIST, params.clone());
            if tx.send(text_message(&request)).is_err() {
                self.pending_refresh.lock().remove(&id);
                continue;
            }
            tracing::debug!(provider = %name, "requested tools refresh");
            waiters.push(done_rx);
        }

        if tokio::time::timeout(REFRESH_TIMEOUT, futures::future::join_all(waiters))
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for tools refresh; returning partial results");
        }

        self.pending_refresh
            .lock()
            .retain(|id, _| !id.starts_with("refresh_tools_"));
    }

    /// Merge cached provider tools into the virtual surface.
    ///
    /// First occurrence of a name wins it outright; later occurrences from
    /// other providers are renamed to `<provider>.<name>`. Every admitted
    /// tool's description gains a `[<provider>] ` prefix, and the routing
    /// registry learns each display name.
    #[must_use]
    pub fn aggregate_tools(&self) -> Vec<Value> {
        let order = self.provider_order.read().clone();
        let tools_by_provider = self.provider_tools.read().clone();
        let mut registry = self.registry.write();

        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for provider in order {
            let Some(tools) = tools_by_provider.get(&provider) else {
                continue;
            };
            for tool in tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let mut admitted = tool.clone();
                let description = tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                if seen.contains(name) {
                    let prefixed = format!("{provider}.{name}");
                    tracing::info!(
                        tool = %name,
                        renamed = %prefixed,
                        "tool name conflict; prefixing with provider"
                    );
                    admitted["name"] = prefixed.clone().into();
                    registry.insert(prefixed, provider.clone());
                } else {
                    seen.insert(name.to_string());
                    registry.insert(name.to_string(), provider.clone());
                }

                admitted["description"] = format!("[{provider}] {description}").into();
                out.push(admitted);
            }
        }

        out
    }

    // ── fan-out helpers ──────────────────────────────────────────────────

    fn send_to_provider(&self, name: &str, frame: &Frame) {
        if let Some(tx) = self.providers.read().get(name) {
            let _ = tx.send(text_message(frame));
        }
    }

    fn broadcast_to_frontends(&self, text: &str) {
        let frontends: Vec<FrameSender> = self.frontends.read().values().cloned().collect();
        for tx in frontends {
            let _ = tx.send(Message::Text(text.to_string().into()));
        }
    }

    /// Forward an uninterpreted frontend frame to every provider; with no
    /// providers connected, answer with a JSON-RPC error instead.
    fn forward_to_all_providers(&self, tx: &FrameSender, text: &str) {
        let providers: Vec<FrameSender> = self.providers.read().values().cloned().collect();
        if providers.is_empty() {
            let _ = tx.send(text_message(&Frame::error_response(
                None,
                error_codes::PROVIDER_UNAVAILABLE,
                "No provider connected",
            )));
            return;
        }
        for provider_tx in providers {
            let _ = provider_tx.send(Message::Text(text.to_string().into()));
        }
    }
}

fn text_message(frame: &Frame) -> Message {
    Message::Text(frame.to_line().into())
}

fn is_hub_issued_id(id: &str) -> bool {
    id.starts_with("hub_init_") || id.starts_with("hub_tools_") || id.starts_with("refresh_tools_")
}
