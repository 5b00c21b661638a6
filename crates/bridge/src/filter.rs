//! Outbound `tools/list` response filtering.
//!
//! Two phases per response: cache the raw list for the admin UI, then drop
//! disabled tools and overlay custom descriptions from the tool-settings
//! store. Custom *names* are admin-display only and never touch the wire;
//! renaming on the wire happens solely in the hub's conflict resolution.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tether_protocol::Frame;
use tether_store::{CustomTools, DisabledTools, EndpointStore, ToolsCacheFile};

/// Request ids whose `tools/list` asked for `include_disabled`.
///
/// Keyed per bridge and short-lived: an entry is consumed when the matching
/// response passes back through.
#[derive(Default)]
pub struct IncludeDisabledFlags {
    ids: Mutex<HashSet<String>>,
}

impl IncludeDisabledFlags {
    // Unmatched requests (e.g. a child that died mid-call) would otherwise
    // accumulate for the bridge's lifetime.
    const MAX_PENDING: usize = 1024;

    pub fn record(&self, id: String) {
        let mut ids = self.ids.lock();
        if ids.len() >= Self::MAX_PENDING {
            ids.clear();
        }
        ids.insert(id);
    }

    pub fn take(&self, id: &str) -> bool {
        self.ids.lock().remove(id)
    }
}

/// Applies the two-phase transform to frames flowing child → WebSocket.
pub struct ResponseFilter {
    store: Arc<dyn EndpointStore>,
    cache: ToolsCacheFile,
}

impl ResponseFilter {
    #[must_use]
    pub fn new(store: Arc<dyn EndpointStore>, cache: ToolsCacheFile) -> Self {
        Self { store, cache }
    }

    /// Filter a `tools/list` response in place. Frames without a
    /// `result.tools` array pass through untouched.
    pub async fn apply(&self, frame: &mut Frame, provider: &str, include_disabled: bool) {
        let Some(tools) = frame.tools() else {
            return;
        };

        // Phase 1: raw cache, before any policy is applied.
        if let Err(e) = self.cache.put(provider, tools.clone()) {
            tracing::error!(provider = %provider, error = %e, "failed to cache raw tool list");
        }

        // Phase 2: policy overlay. A store read failure means no policy,
        // not a dead bridge.
        let (disabled, custom) = self.load_settings().await;
        let disabled_here = disabled.get(provider);
        let custom_here = custom.get(provider);

        let Some(tools) = frame.tools_mut() else {
            return;
        };
        let before = tools.len();

        tools.retain_mut(|tool| {
            let Some(name) = tool.get("name").and_then(|n| n.as_str()).map(str::to_string)
            else {
                return false;
            };

            if !include_disabled
                && disabled_here.is_some_and(|names| names.iter().any(|n| *n == name))
            {
                tracing::debug!(provider = %provider, tool = %name, "filtering out disabled tool");
                return false;
            }

            if let Some(description) = custom_here
                .and_then(|tools| tools.get(&name))
                .and_then(|overlay| overlay.description.as_deref())
            {
                tool["description"] = description.into();
            }
            true
        });

        tracing::info!(
            provider = %provider,
            before,
            after = tools.len(),
            include_disabled,
            "filtered tools/list response"
        );
    }

    async fn load_settings(&self) -> (DisabledTools, CustomTools) {
        let disabled = match self.store.get_disabled_tools().await {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(error = %e, "failed to load disabled tools");
                DisabledTools::default()
            }
        };
        let custom = match self.store.get_custom_tools().await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "failed to load custom tools");
                CustomTools::default()
            }
        };
        (disabled, custom)
    }
}
