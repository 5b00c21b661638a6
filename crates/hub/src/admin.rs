//! Admin HTTP surface over the endpoint store.
//!
//! Mutations publish CONNECT/DISCONNECT/UPDATE events on the command fanout
//! so running bridge hosts converge without a restart. Publishing is
//! best-effort: a missed event is corrected by the reconciler's next poll.

use crate::discovery::discover_provider_tools;
use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_config::ProviderSpec;
use tether_store::{
    CustomTools, DisabledTools, Endpoint, EndpointAction, EndpointBackup, EndpointEvent,
    EndpointPatch, EndpointStore, ToolsCacheFile,
};

/// Cadence of the endpoint status stream.
pub const SSE_INTERVAL: Duration = Duration::from_secs(10);

pub struct AdminState {
    pub store: Arc<dyn EndpointStore>,
    pub fanout: Option<tether_store::CommandFanout>,
    pub tools_cache: ToolsCacheFile,
    pub config_path: PathBuf,
    pub proxy_bin: String,
}

pub fn router() -> Router {
    Router::new()
        .route("/endpoints", get(list_endpoints).post(create_endpoint))
        .route("/endpoints/stream", get(endpoints_stream))
        .route(
            "/endpoints/{id}",
            get(get_endpoint).put(update_endpoint).delete(delete_endpoint),
        )
        .route("/mcp-tools", get(get_mcp_tools))
        .route("/mcp-tools/cache", get(get_tools_cache))
        .route("/mcp-tools/toggle", post(toggle_tool))
        .route("/mcp-tools/update", post(update_tool))
        .route("/mcp-tools/reset", post(reset_tool))
        .route("/mcp-tools/refresh", post(refresh_tools))
        .route("/backup", get(backup))
        .route("/restore", post(restore))
}

async fn publish_event(state: &AdminState, action: EndpointAction, endpoint: &Endpoint) {
    let Some(fanout) = &state.fanout else { return };
    let event = EndpointEvent {
        action,
        endpoint: endpoint.as_ref_parts(),
    };
    if let Err(e) = fanout.publish(&event).await {
        tracing::warn!(
            error = %e,
            action = ?action,
            endpoint = %endpoint.name,
            "failed to publish endpoint event"
        );
    }
}

// ── endpoints ────────────────────────────────────────────────────────────

async fn list_endpoints(Extension(state): Extension<Arc<AdminState>>) -> impl IntoResponse {
    match state.store.list_endpoints().await {
        Ok(endpoints) => Json(json!({ "endpoints": endpoints })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_endpoint(
    Extension(state): Extension<Arc<AdminState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get_endpoint(id).await {
        Ok(Some(endpoint)) => Json(endpoint).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Emits `{endpoints: [...]}` immediately and then every ten seconds.
async fn endpoints_stream(Extension(state): Extension<Arc<AdminState>>) -> impl IntoResponse {
    let store = state.store.clone();
    let stream = futures::stream::unfold(0u64, move |tick| {
        let store = store.clone();
        async move {
            if tick > 0 {
                tokio::time::sleep(SSE_INTERVAL).await;
            }
            let endpoints = store.list_endpoints().await.unwrap_or_default();
            let payload = serde_json::to_string(&json!({ "endpoints": endpoints }))
                .unwrap_or_else(|_| "{}".to_string());
            Some((Ok::<_, Infallible>(Event::default().data(payload)), tick + 1))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEndpointRequest {
    name: String,
    url: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

async fn create_endpoint(
    Extension(state): Extension<Arc<AdminState>>,
    Json(req): Json<CreateEndpointRequest>,
) -> impl IntoResponse {
    let name = req.name.trim();
    let url = req.url.trim();
    if name.is_empty() || url.is_empty() {
        return (StatusCode::BAD_REQUEST, "Name and URL are required").into_response();
    }

    match state.store.get_endpoint_by_name(name).await {
        Ok(Some(_)) => {
            return (StatusCode::CONFLICT, "endpoint name already exists").into_response();
        }
        Ok(None) => {}
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }

    match state.store.upsert_endpoint(name, url, req.enabled).await {
        Ok((endpoint, _created)) => {
            if endpoint.enabled {
                publish_event(&state, EndpointAction::Connect, &endpoint).await;
            }
            (StatusCode::CREATED, Json(endpoint)).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateEndpointRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn update_endpoint(
    Extension(state): Extension<Arc<AdminState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateEndpointRequest>,
) -> impl IntoResponse {
    let current = match state.store.get_endpoint(id).await {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let patch = EndpointPatch {
        name: req.name,
        url: req.url,
        enabled: req.enabled,
    };
    let updated = match state.store.update_endpoint(id, patch).await {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    if updated.enabled && !current.enabled {
        publish_event(&state, EndpointAction::Connect, &updated).await;
    } else if !updated.enabled && current.enabled {
        publish_event(&state, EndpointAction::Disconnect, &updated).await;
    } else if updated.enabled && (current.url != updated.url || current.name != updated.name) {
        // Retarget while live: subscribers reconnect against the new URL.
        publish_event(&state, EndpointAction::Update, &updated).await;
    }

    Json(updated).into_response()
}

async fn delete_endpoint(
    Extension(state): Extension<Arc<AdminState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let current = match state.store.get_endpoint(id).await {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => return (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    match state.store.delete_endpoint(id).await {
        Ok(true) => {
            if current.enabled {
                publish_event(&state, EndpointAction::Disconnect, &current).await;
            }
            Json(json!({ "success": true })).into_response()
        }
        Ok(false) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ── tool settings ────────────────────────────────────────────────────────

async fn get_mcp_tools(Extension(state): Extension<Arc<AdminState>>) -> impl IntoResponse {
    let disabled = match state.store.get_disabled_tools().await {
        Ok(d) => d,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let custom = match state.store.get_custom_tools().await {
        Ok(c) => c,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    Json(json!({ "disabledTools": disabled, "customTools": custom })).into_response()
}

async fn get_tools_cache(Extension(state): Extension<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!({ "tools": state.tools_cache.load() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolToggleRequest {
    server_name: String,
    tool_name: String,
    enabled: bool,
}

async fn toggle_tool(
    Extension(state): Extension<Arc<AdminState>>,
    Json(req): Json<ToolToggleRequest>,
) -> impl IntoResponse {
    if req.server_name.is_empty() || req.tool_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "serverName and toolName are required").into_response();
    }
    match state
        .store
        .set_tool_enabled(&req.server_name, &req.tool_name, req.enabled)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "enabled": req.enabled })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUpdateRequest {
    server_name: String,
    tool_name: String,
    #[serde(default)]
    custom_name: Option<String>,
    #[serde(default)]
    custom_description: Option<String>,
}

async fn update_tool(
    Extension(state): Extension<Arc<AdminState>>,
    Json(req): Json<ToolUpdateRequest>,
) -> impl IntoResponse {
    if req.server_name.is_empty() || req.tool_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "serverName and toolName are required").into_response();
    }

    let custom_name = req
        .custom_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let custom_description = req
        .custom_description
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match state
        .store
        .set_tool_metadata(&req.server_name, &req.tool_name, custom_name, custom_description)
        .await
    {
        Ok(()) => {
            let mut meta = serde_json::Map::new();
            if let Some(name) = custom_name {
                meta.insert("name".to_string(), name.into());
            }
            if let Some(description) = custom_description {
                meta.insert("description".to_string(), description.into());
            }
            Json(json!({ "success": true, "customMeta": meta })).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResetRequest {
    server_name: String,
    tool_name: String,
}

async fn reset_tool(
    Extension(state): Extension<Arc<AdminState>>,
    Json(req): Json<ToolResetRequest>,
) -> impl IntoResponse {
    if req.server_name.is_empty() || req.tool_name.is_empty() {
        return (StatusCode::BAD_REQUEST, "serverName and toolName are required").into_response();
    }
    match state
        .store
        .reset_tool_metadata(&req.server_name, &req.tool_name)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolRefreshRequest {
    #[serde(default)]
    server_name: Option<String>,
}

/// Rediscover one provider's tools (or every enabled provider's) by
/// spawning it and walking the stdio handshake.
async fn refresh_tools(
    Extension(state): Extension<Arc<AdminState>>,
    Json(req): Json<ToolRefreshRequest>,
) -> impl IntoResponse {
    let config = match tether_config::load_config(&state.config_path) {
        Ok(config) => config,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    if let Some(name) = req.server_name.as_deref() {
        let Some(spec) = config.get(name) else {
            return (StatusCode::NOT_FOUND, "Server not found").into_response();
        };
        return match discover_provider_tools(name, spec, &state.proxy_bin, &state.tools_cache)
            .await
        {
            Ok(tools) => Json(json!({
                "success": true,
                "server": name,
                "toolsDiscovered": tools.len(),
            }))
            .into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };
    }

    let mut refreshed: Vec<String> = Vec::new();
    let mut total = 0usize;
    for (name, spec) in &config.providers {
        if spec.disabled {
            continue;
        }
        match discover_provider_tools(name, spec, &state.proxy_bin, &state.tools_cache).await {
            Ok(tools) => {
                total += tools.len();
                refreshed.push(name.clone());
            }
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "tool discovery failed");
            }
        }
    }

    Json(json!({
        "success": true,
        "serversRefreshed": refreshed,
        "totalToolsDiscovered": total,
    }))
    .into_response()
}

// ── backup / restore ─────────────────────────────────────────────────────

async fn backup(Extension(state): Extension<Arc<AdminState>>) -> impl IntoResponse {
    let endpoints = match state.store.list_endpoints().await {
        Ok(endpoints) => endpoints,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let disabled = match state.store.get_disabled_tools().await {
        Ok(d) => d,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let custom = match state.store.get_custom_tools().await {
        Ok(c) => c,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let config = tether_config::load_config(&state.config_path).unwrap_or_default();

    Json(json!({
        "version": "1.0",
        "exportedAt": chrono::Utc::now().to_rfc3339(),
        "endpoints": endpoints,
        "disabledTools": disabled,
        "customTools": custom,
        "mcpServers": config.providers,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestoreRequest {
    #[serde(default)]
    endpoints: Option<Vec<EndpointBackup>>,
    #[serde(default)]
    disabled_tools: Option<DisabledTools>,
    #[serde(default)]
    custom_tools: Option<CustomTools>,
    #[serde(default)]
    mcp_servers: Option<BTreeMap<String, ProviderSpec>>,
}

async fn restore(
    Extension(state): Extension<Arc<AdminState>>,
    Json(req): Json<RestoreRequest>,
) -> impl IntoResponse {
    if req.endpoints.is_none()
        && req.disabled_tools.is_none()
        && req.custom_tools.is_none()
        && req.mcp_servers.is_none()
    {
        return (StatusCode::BAD_REQUEST, "No restore data provided").into_response();
    }

    let mut restored_endpoints = 0usize;
    if let Some(endpoints) = &req.endpoints {
        restored_endpoints = match state.store.replace_endpoints(endpoints).await {
            Ok(n) => n,
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };
    }

    if req.disabled_tools.is_some() || req.custom_tools.is_some() {
        let disabled = req.disabled_tools.unwrap_or_default();
        let custom = req.custom_tools.unwrap_or_default();
        if let Err(e) = state.store.replace_tool_settings(&disabled, &custom).await {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }

    if let Some(providers) = &req.mcp_servers {
        let doc = json!({ "mcpServers": providers });
        let text = serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = std::fs::write(&state.config_path, text) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        // The reconciler notices the mtime change on its next poll.
    }

    tracing::info!(restored_endpoints, "restored from backup");
    Json(json!({ "success": true, "restoredEndpoints": restored_endpoints })).into_response()
}
