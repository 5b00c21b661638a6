use crate::{
    ConnectionStatus, CustomTools, DisabledTools, Endpoint, EndpointBackup, EndpointPatch,
    EndpointStore, StoreError, ToolOverlay,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct ToolSettingRow {
    enabled: bool,
    custom_name: Option<String>,
    custom_description: Option<String>,
}

#[derive(Default)]
struct Inner {
    endpoints: BTreeMap<i64, Endpoint>,
    next_id: i64,
    tool_settings: BTreeMap<(String, String), ToolSettingRow>,
}

/// In-process store for tests and `memory:` URLs. Same contract as the
/// Postgres store, minus durability and cross-process sharing.
#[derive(Default)]
pub struct MemoryEndpointStore {
    inner: Mutex<Inner>,
}

impl MemoryEndpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn setting_entry(&mut self, provider: &str, tool: &str) -> &mut ToolSettingRow {
        self.tool_settings
            .entry((provider.to_string(), tool.to_string()))
            .or_insert_with(|| ToolSettingRow {
                enabled: true,
                ..ToolSettingRow::default()
            })
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.inner.lock().endpoints.values().cloned().collect())
    }

    async fn list_enabled_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self
            .inner
            .lock()
            .endpoints
            .values()
            .filter(|e| e.enabled)
            .cloned()
            .collect())
    }

    async fn get_endpoint(&self, id: i64) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.inner.lock().endpoints.get(&id).cloned())
    }

    async fn get_endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>, StoreError> {
        Ok(self
            .inner
            .lock()
            .endpoints
            .values()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn upsert_endpoint(
        &self,
        name: &str,
        url: &str,
        enabled: bool,
    ) -> Result<(Endpoint, bool), StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        if let Some(existing) = inner.endpoints.values_mut().find(|e| e.name == name) {
            existing.url = url.to_string();
            existing.enabled = enabled;
            existing.updated_at = now;
            return Ok((existing.clone(), false));
        }

        inner.next_id += 1;
        let endpoint = Endpoint {
            id: inner.next_id,
            name: name.to_string(),
            url: url.to_string(),
            enabled,
            connection_status: ConnectionStatus::Disconnected,
            last_connected_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        inner.endpoints.insert(endpoint.id, endpoint.clone());
        Ok((endpoint, true))
    }

    async fn update_endpoint(
        &self,
        id: i64,
        patch: EndpointPatch,
    ) -> Result<Option<Endpoint>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(endpoint) = inner.endpoints.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            endpoint.name = name;
        }
        if let Some(url) = patch.url {
            endpoint.url = url;
        }
        if let Some(enabled) = patch.enabled {
            endpoint.enabled = enabled;
        }
        endpoint.updated_at = Utc::now();
        Ok(Some(endpoint.clone()))
    }

    async fn update_status(
        &self,
        id: i64,
        status: ConnectionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let Some(endpoint) = inner.endpoints.get_mut(&id) else {
            return Ok(());
        };
        let now = Utc::now();
        endpoint.connection_status = status;
        endpoint.updated_at = now;
        if status == ConnectionStatus::Connected {
            endpoint.last_connected_at = Some(now);
            endpoint.last_error = None;
        } else if let Some(error) = error {
            endpoint.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn delete_endpoint(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().endpoints.remove(&id).is_some())
    }

    async fn replace_endpoints(&self, endpoints: &[EndpointBackup]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        inner.endpoints.clear();
        inner.next_id = 0;
        let now = Utc::now();
        for ep in endpoints {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.endpoints.insert(
                id,
                Endpoint {
                    id,
                    name: ep.name.clone(),
                    url: ep.url.clone(),
                    enabled: ep.enabled,
                    connection_status: ConnectionStatus::Disconnected,
                    last_connected_at: None,
                    last_error: None,
                    created_at: ep.created_at.unwrap_or(now),
                    updated_at: now,
                },
            );
        }
        Ok(endpoints.len())
    }

    async fn get_disabled_tools(&self) -> Result<DisabledTools, StoreError> {
        let inner = self.inner.lock();
        let mut out: DisabledTools = HashMap::new();
        for ((provider, tool), row) in &inner.tool_settings {
            if !row.enabled {
                out.entry(provider.clone()).or_default().push(tool.clone());
            }
        }
        Ok(out)
    }

    async fn get_custom_tools(&self) -> Result<CustomTools, StoreError> {
        let inner = self.inner.lock();
        let mut out: CustomTools = HashMap::new();
        for ((provider, tool), row) in &inner.tool_settings {
            if row.custom_name.is_some() || row.custom_description.is_some() {
                out.entry(provider.clone()).or_default().insert(
                    tool.clone(),
                    ToolOverlay {
                        name: row.custom_name.clone(),
                        description: row.custom_description.clone(),
                    },
                );
            }
        }
        Ok(out)
    }

    async fn set_tool_enabled(
        &self,
        provider: &str,
        tool: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        self.inner.lock().setting_entry(provider, tool).enabled = enabled;
        Ok(())
    }

    async fn set_tool_metadata(
        &self,
        provider: &str,
        tool: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.setting_entry(provider, tool);
        if let Some(name) = name {
            row.custom_name = Some(name.to_string());
        }
        if let Some(description) = description {
            row.custom_description = Some(description.to_string());
        }
        Ok(())
    }

    async fn reset_tool_metadata(&self, provider: &str, tool: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner
            .tool_settings
            .get_mut(&(provider.to_string(), tool.to_string()))
        {
            row.custom_name = None;
            row.custom_description = None;
        }
        Ok(())
    }

    async fn remove_tools_for_provider(&self, provider: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .tool_settings
            .retain(|(p, _), _| p != provider);
        Ok(())
    }

    async fn replace_tool_settings(
        &self,
        disabled: &DisabledTools,
        custom: &CustomTools,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.tool_settings.clear();
        for (provider, tools) in disabled {
            for tool in tools {
                inner.setting_entry(provider, tool).enabled = false;
            }
        }
        for (provider, tools) in custom {
            for (tool, overlay) in tools {
                let row = inner.setting_entry(provider, tool);
                row.custom_name = overlay.name.clone();
                row.custom_description = overlay.description.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_unique_by_name() {
        let store = MemoryEndpointStore::new();
        let (first, created) = store
            .upsert_endpoint("lab", "ws://a.example", true)
            .await
            .expect("upsert");
        assert!(created);

        let (second, created) = store
            .upsert_endpoint("lab", "ws://b.example", false)
            .await
            .expect("upsert");
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.url, "ws://b.example");
        assert!(!second.enabled);
        assert_eq!(store.list_endpoints().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn connected_status_stamps_time_and_clears_error() {
        let store = MemoryEndpointStore::new();
        let (ep, _) = store
            .upsert_endpoint("lab", "ws://a.example", true)
            .await
            .expect("upsert");

        store
            .update_status(ep.id, ConnectionStatus::Error, Some("connect refused"))
            .await
            .expect("status");
        let got = store.get_endpoint(ep.id).await.expect("get").expect("some");
        assert_eq!(got.connection_status, ConnectionStatus::Error);
        assert_eq!(got.last_error.as_deref(), Some("connect refused"));

        let before = got.updated_at;
        store
            .update_status(ep.id, ConnectionStatus::Connected, None)
            .await
            .expect("status");
        let got = store.get_endpoint(ep.id).await.expect("get").expect("some");
        assert_eq!(got.connection_status, ConnectionStatus::Connected);
        assert!(got.last_error.is_none());
        assert!(got.last_connected_at.expect("stamped") >= before);
    }

    #[tokio::test]
    async fn tool_metadata_upsert_preserves_on_none() {
        let store = MemoryEndpointStore::new();
        store
            .set_tool_metadata("p1", "echo", Some("Echo!"), Some("custom desc"))
            .await
            .expect("set");
        store
            .set_tool_metadata("p1", "echo", None, Some("newer desc"))
            .await
            .expect("set");

        let custom = store.get_custom_tools().await.expect("get");
        let overlay = &custom["p1"]["echo"];
        assert_eq!(overlay.name.as_deref(), Some("Echo!"));
        assert_eq!(overlay.description.as_deref(), Some("newer desc"));
    }

    #[tokio::test]
    async fn remove_tools_cascades_per_provider() {
        let store = MemoryEndpointStore::new();
        store.set_tool_enabled("p1", "echo", false).await.expect("set");
        store.set_tool_enabled("p2", "search", false).await.expect("set");

        store.remove_tools_for_provider("p1").await.expect("remove");

        let disabled = store.get_disabled_tools().await.expect("get");
        assert!(!disabled.contains_key("p1"));
        assert!(disabled.contains_key("p2"));
    }

    #[tokio::test]
    async fn absent_setting_means_enabled_with_no_overlay() {
        let store = MemoryEndpointStore::new();
        assert!(store.get_disabled_tools().await.expect("get").is_empty());
        assert!(store.get_custom_tools().await.expect("get").is_empty());
    }
}
