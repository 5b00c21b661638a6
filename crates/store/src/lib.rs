//! Durable endpoint + tool-settings store, and the control-plane fanout.
//!
//! The store is exposed as `Arc<dyn EndpointStore>`: the bridge writes
//! connection status into it, the admin API mutates it, and the reconciler
//! enumerates it. The Postgres implementation is the production one; the
//! in-memory implementation backs tests and `memory:` URLs.

mod events;
mod memory;
mod pg;
mod tools_cache;

pub use events::{COMMANDS_CHANNEL, CommandFanout, EndpointAction, EndpointEvent, EndpointRef};
pub use memory::MemoryEndpointStore;
pub use pg::PgEndpointStore;
pub use tools_cache::{CachedTools, ToolsCacheFile};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unsupported store URL '{0}' (expected postgres://… or memory:)")]
    UnsupportedUrl(String),
}

/// Connection state of one endpoint, as last reported by its bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disconnected" => Some(Self::Disconnected),
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One durable endpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub connection_status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    #[must_use]
    pub fn as_ref_parts(&self) -> EndpointRef {
        EndpointRef {
            id: self.id,
            name: self.name.clone(),
            url: self.url.clone(),
        }
    }
}

/// Partial update for PUT semantics: `None` keeps the existing value.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub enabled: Option<bool>,
}

/// Custom metadata overlaid on one tool, for the admin UI and the filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Endpoint row as it appears in a backup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointBackup {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// Mapping provider → disabled tool names.
pub type DisabledTools = HashMap<String, Vec<String>>;
/// Mapping provider → tool → overlay.
pub type CustomTools = HashMap<String, HashMap<String, ToolOverlay>>;

/// The durable store contract shared by the bridge, hub, and admin API.
///
/// Concurrency: many readers, effectively one writer (tens of writes per
/// minute); implementations serialize writes internally. Status writes are
/// last-write-wins.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;
    async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;
    async fn get_endpoint(&self, id: i64) -> Result<Option<Endpoint>, StoreError>;
    async fn get_endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>, StoreError>;

    /// Insert or update by unique name. Returns the record and whether it
    /// was created.
    async fn upsert_endpoint(
        &self,
        name: &str,
        url: &str,
        enabled: bool,
    ) -> Result<(Endpoint, bool), StoreError>;

    async fn update_endpoint(
        &self,
        id: i64,
        patch: EndpointPatch,
    ) -> Result<Option<Endpoint>, StoreError>;

    /// Record a status transition. On `Connected` this also stamps
    /// `last_connected_at` and clears `last_error`; on other statuses the
    /// error message is replaced only when one is given.
    async fn update_status(
        &self,
        id: i64,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn delete_endpoint(&self, id: i64) -> Result<bool, StoreError>;

    /// Restore: replace the whole endpoints table.
    async fn replace_endpoints(&self, endpoints: &[EndpointBackup]) -> Result<usize, StoreError>;

    async fn get_disabled_tools(&self) -> Result<DisabledTools, StoreError>;
    async fn get_custom_tools(&self) -> Result<CustomTools, StoreError>;
    async fn set_tool_enabled(
        &self,
        provider: &str,
        tool: &str,
        enabled: bool,
    ) -> Result<(), StoreError>;

    /// Upsert custom metadata. `None` preserves whatever is stored.
    async fn set_tool_metadata(
        &self,
        provider: &str,
        tool: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn reset_tool_metadata(&self, provider: &str, tool: &str) -> Result<(), StoreError>;
    async fn remove_tools_for_provider(&self, provider: &str) -> Result<(), StoreError>;

    /// Restore: replace all tool settings from backup maps.
    async fn replace_tool_settings(
        &self,
        disabled: &DisabledTools,
        custom: &CustomTools,
    ) -> Result<(), StoreError>;
}

/// A connected store plus the fanout bound to the same backend, when the
/// backend supports pub/sub.
pub struct StoreHandle {
    pub store: Arc<dyn EndpointStore>,
    /// `None` for `memory:` stores; callers treat publishing as best-effort
    /// and skip it.
    pub fanout: Option<CommandFanout>,
}

/// Open a store by URL. `postgres://…` runs migrations and wires the
/// LISTEN/NOTIFY fanout; `memory:` is an empty in-process store.
pub async fn connect(url: &str) -> Result<StoreHandle, StoreError> {
    if url == "memory:" {
        return Ok(StoreHandle {
            store: Arc::new(MemoryEndpointStore::new()),
            fanout: None,
        });
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let pool = sqlx::PgPool::connect(url).await?;
        pg::run_migrations(&pool).await?;
        let node_id = uuid::Uuid::new_v4().to_string();
        return Ok(StoreHandle {
            store: Arc::new(PgEndpointStore::new(pool.clone())),
            fanout: Some(CommandFanout::new(pool, node_id)),
        });
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}
