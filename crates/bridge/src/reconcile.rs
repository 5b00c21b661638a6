//! Control-plane reconciliation.
//!
//! The reconciler is the only owner of bridge supervisor handles. It drives
//! the running set toward {enabled endpoints} × {enabled providers}, waking
//! on a 10s poll (config mtime + store re-sync) and on pub/sub events.
//! Every wake recomputes the desired set from scratch, so duplicate events
//! coalesce and stale events are harmless.

use crate::supervisor::{self, BridgeContext};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tether_config::config_mtime;
use tether_store::{Endpoint, EndpointEvent, EndpointRef};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// How long a cancelled supervisor gets to shut down before its slot is
/// forcibly reclaimed.
pub const CANCEL_SHIELD: Duration = Duration::from_secs(2);

/// Identity of one running bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeKey {
    pub endpoint: String,
    pub provider: String,
}

struct BridgeHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// URL the supervisor was spawned with; a mismatch against the store
    /// means the endpoint was retargeted and the bridge must respawn.
    url: String,
}

/// Compute the desired bridge set from the current sources of truth.
#[must_use]
pub fn desired_bridges(
    endpoints: &[Endpoint],
    providers: &[String],
) -> BTreeMap<BridgeKey, EndpointRef> {
    let mut desired = BTreeMap::new();
    for endpoint in endpoints {
        for provider in providers {
            desired.insert(
                BridgeKey {
                    endpoint: endpoint.name.clone(),
                    provider: provider.clone(),
                },
                endpoint.as_ref_parts(),
            );
        }
    }
    desired
}

pub struct Reconciler {
    ctx: Arc<BridgeContext>,
    running: HashMap<BridgeKey, BridgeHandle>,
    providers: Vec<String>,
    /// Every name in the last successfully loaded config, disabled included.
    /// Names that vanish from the file get their tool settings cascaded away.
    known_providers: Vec<String>,
    config_mtime: Option<SystemTime>,
    config_loaded: bool,
}

impl Reconciler {
    #[must_use]
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            running: HashMap::new(),
            providers: Vec::new(),
            known_providers: Vec::new(),
            config_mtime: None,
            config_loaded: false,
        }
    }

    /// Run until cancelled. `events` is the pub/sub feed; the poll tick
    /// covers missed events.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<EndpointEvent>,
        cancel: CancellationToken,
    ) {
        self.reload_config_if_changed().await;
        self.reconcile().await;

        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; we already reconciled.
        tick.tick().await;

        let mut events_open = true;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.reload_config_if_changed().await;
                    self.reconcile().await;
                }
                event = events.recv(), if events_open => {
                    let Some(event) = event else {
                        // Event feed gone; the poll loop carries on alone.
                        events_open = false;
                        continue;
                    };
                    tracing::info!(
                        action = ?event.action,
                        endpoint = %event.endpoint.name,
                        "received endpoint event"
                    );
                    // Coalesce whatever queued up behind this event; one
                    // pass serves them all.
                    while events.try_recv().is_ok() {}
                    self.reconcile().await;
                }
            }
        }

        self.shutdown_all().await;
    }

    /// One serialized reconciliation pass.
    pub async fn reconcile(&mut self) {
        let endpoints = match self.ctx.store.list_enabled_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate endpoints; keeping current bridges");
                return;
            }
        };

        let desired = desired_bridges(&endpoints, &self.providers);

        let stale: Vec<BridgeKey> = self
            .running
            .iter()
            .filter(|(key, handle)| {
                desired
                    .get(*key)
                    .is_none_or(|endpoint| endpoint.url != handle.url)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.stop_bridge(&key).await;
        }

        for (key, endpoint) in desired {
            if !self.running.contains_key(&key) {
                self.spawn_bridge(key, endpoint);
            }
        }
    }

    fn spawn_bridge(&mut self, key: BridgeKey, endpoint: EndpointRef) {
        tracing::info!(
            endpoint = %key.endpoint,
            provider = %key.provider,
            url = %endpoint.url,
            "starting bridge"
        );
        let cancel = CancellationToken::new();
        let url = endpoint.url.clone();
        let task = tokio::spawn(supervisor::run_bridge(
            self.ctx.clone(),
            endpoint,
            key.provider.clone(),
            cancel.clone(),
        ));
        self.running.insert(key, BridgeHandle { cancel, task, url });
    }

    /// Cancel one bridge and wait (bounded) for it to release its child and
    /// socket. The slot is free for respawn only after this returns.
    async fn stop_bridge(&mut self, key: &BridgeKey) {
        let Some(handle) = self.running.remove(key) else {
            return;
        };
        tracing::info!(endpoint = %key.endpoint, provider = %key.provider, "stopping bridge");
        handle.cancel.cancel();
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(CANCEL_SHIELD, handle.task).await.is_err() {
            tracing::warn!(
                endpoint = %key.endpoint,
                provider = %key.provider,
                "bridge did not stop within the shield timeout; aborting"
            );
            abort.abort();
        }
    }

    async fn shutdown_all(&mut self) {
        let keys: Vec<BridgeKey> = self.running.keys().cloned().collect();
        for key in keys {
            self.stop_bridge(&key).await;
        }
    }

    /// Reload provider config when the file's mtime moved (or on first
    /// call). A file that fails to parse keeps the previous provider list.
    async fn reload_config_if_changed(&mut self) -> bool {
        let mtime = config_mtime(&self.ctx.config_path);
        if self.config_loaded && mtime == self.config_mtime {
            return false;
        }

        match tether_config::load_config(&self.ctx.config_path) {
            Ok(config) => {
                let all_names: Vec<String> = config.providers.keys().cloned().collect();
                let enabled = config.enabled_providers();

                // A provider that was disabled or deleted stops running, so
                // its raw cached tools are stale immediately. Deletion also
                // cascades away its tool settings.
                for name in &self.providers {
                    if !enabled.contains(name) {
                        let _ = self.ctx.tools_cache.remove(name);
                    }
                }
                for name in &self.known_providers {
                    if !all_names.contains(name) {
                        if let Err(e) = self.ctx.store.remove_tools_for_provider(name).await {
                            tracing::warn!(
                                provider = %name,
                                error = %e,
                                "failed to cascade tool settings for removed provider"
                            );
                        }
                    }
                }

                let disabled: Vec<&String> = all_names
                    .iter()
                    .filter(|name| !enabled.contains(name))
                    .collect();
                if !disabled.is_empty() {
                    tracing::info!(?disabled, "skipping disabled providers");
                    for name in &disabled {
                        let _ = self.ctx.tools_cache.remove(name);
                    }
                }
                tracing::info!(providers = ?enabled, "loaded provider config");
                self.providers = enabled;
                self.known_providers = all_names;
                self.config_loaded = true;
                self.config_mtime = mtime;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load provider config; keeping previous");
                self.config_mtime = mtime;
                true
            }
        }
    }

    /// Keys of currently tracked bridges (running or finished-but-claimed).
    #[must_use]
    pub fn running_keys(&self) -> Vec<BridgeKey> {
        let mut keys: Vec<BridgeKey> = self.running.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn running_url(&self, key: &BridgeKey) -> Option<&str> {
        self.running.get(key).map(|h| h.url.as_str())
    }
}
