//! Periodic catalog refresh with added/removed tool detection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{HitlConfig, ProxyConfig};
use crate::upstream::UpstreamRegistry;

const EVENT_CAPACITY: usize = 64;

/// Difference between two successive catalogs of one service
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogChange {
    pub service_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Added tools the service policy already lets through
    pub added_allowed: Vec<String>,
    pub added_blocked: Vec<String>,
}

impl CatalogChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Cached catalog of one service classified against configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDiff {
    pub service_id: String,
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
    pub approval_required: Vec<String>,
}

pub struct DiscoveryPoller {
    registry: Arc<UpstreamRegistry>,
    known: DashMap<String, BTreeSet<String>>,
    events: broadcast::Sender<CatalogChange>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryPoller {
    /// Seed the known tool sets from the registry's current catalogs
    pub fn new(registry: Arc<UpstreamRegistry>) -> Self {
        let known = DashMap::new();
        for service in registry.services() {
            known.insert(
                service.id.clone(),
                service.tool_names().into_iter().collect::<BTreeSet<_>>(),
            );
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            known,
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogChange> {
        self.events.subscribe()
    }

    /// Spawn one polling loop per service with discovery enabled
    pub fn start(self: &Arc<Self>, config: &ProxyConfig) {
        let mut tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(e) => e.into_inner(),
        };
        for (id, upstream) in &config.mcps {
            if !upstream.discovery.enabled || self.registry.get(id).is_none() {
                continue;
            }
            let period = upstream.discovery.poll_interval.max(Duration::from_millis(1));
            info!(service = %id, interval_ms = period.as_millis() as u64, "Discovery polling enabled");

            let poller = Arc::clone(self);
            let service_id = id.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = poller.poll(&service_id).await {
                        warn!(service = %service_id, error = %format!("{:#}", e), "Discovery poll failed");
                    }
                }
            }));
        }
    }

    /// Refresh one service and report what changed since the last poll
    pub async fn poll(&self, service_id: &str) -> Result<CatalogChange> {
        let tools = self.registry.refresh_tools(service_id).await?;
        let current: BTreeSet<String> = tools.into_iter().map(|t| t.name).collect();
        let previous = self
            .known
            .insert(service_id.to_string(), current.clone())
            .unwrap_or_default();

        let added: Vec<String> = current.difference(&previous).cloned().collect();
        let removed: Vec<String> = previous.difference(&current).cloned().collect();

        let policy = self.registry.get(service_id).map(|s| s.policy.clone());
        let (added_allowed, added_blocked): (Vec<String>, Vec<String>) =
            added.iter().cloned().partition(|name| {
                policy
                    .as_ref()
                    .map(|p| p.evaluate(name).is_allowed())
                    .unwrap_or(false)
            });

        let change = CatalogChange {
            service_id: service_id.to_string(),
            added,
            removed,
            added_allowed,
            added_blocked,
        };

        if change.is_empty() {
            debug!(service = service_id, "Catalog unchanged");
        } else {
            info!(
                service = service_id,
                added = ?change.added,
                removed = ?change.removed,
                "Upstream catalog changed"
            );
            if !change.added_allowed.is_empty() {
                warn!(
                    service = service_id,
                    tools = ?change.added_allowed,
                    "New tools are reachable under the current policy"
                );
            }
            // No subscribers is fine
            let _ = self.events.send(change.clone());
        }
        Ok(change)
    }

    /// Refresh every service. A service that fails to list reports no tools
    /// and keeps its last known set.
    pub async fn discover_all(&self) -> BTreeMap<String, Vec<String>> {
        let mut result = BTreeMap::new();
        for service in self.registry.services() {
            let names = match self.registry.refresh_tools(&service.id).await {
                Ok(tools) => {
                    let names = tools.into_iter().map(|t| t.name).collect::<Vec<_>>();
                    self.known
                        .insert(service.id.clone(), names.iter().cloned().collect());
                    names
                }
                Err(e) => {
                    warn!(service = %service.id, error = %format!("{:#}", e), "Discovery failed");
                    Vec::new()
                }
            };
            result.insert(service.id.clone(), names);
        }
        result
    }

    /// Classify cached catalogs against policy and approval configuration
    pub fn diff(&self, hitl: &HitlConfig) -> Vec<ServiceDiff> {
        self.registry
            .services()
            .map(|service| {
                let mut diff = ServiceDiff {
                    service_id: service.id.clone(),
                    allowed: Vec::new(),
                    blocked: Vec::new(),
                    approval_required: Vec::new(),
                };
                for name in service.tool_names() {
                    if !service.policy.evaluate(&name).is_allowed() {
                        diff.blocked.push(name);
                        continue;
                    }
                    if hitl.requires_approval(&service.id, &name) {
                        diff.approval_required.push(name.clone());
                    }
                    diff.allowed.push(name);
                }
                diff
            })
            .collect()
    }

    /// Cancel every polling loop
    pub fn stop(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(e) => std::mem::take(&mut *e.into_inner()),
        };
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Stopping discovery polling");
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for DiscoveryPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
