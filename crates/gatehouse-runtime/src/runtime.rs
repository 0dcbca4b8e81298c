use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::{AuditSink, AuditStore};
use crate::config::ProxyConfig;
use crate::discovery::DiscoveryPoller;
use crate::dispatcher::ProxyDispatcher;
use crate::hitl::{ApprovalOrchestrator, ApprovalRequester, NotificationDriver};
use crate::tool::{ToolCatalog, ToolInvoker};
use crate::upstream::{Connector, UpstreamRegistry};

const CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
/// How long shutdown waits for in-flight calls to write their audit rows
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Every long-lived component of a running proxy, wired together
pub struct ProxyRuntime {
    config: ProxyConfig,
    registry: Arc<UpstreamRegistry>,
    orchestrator: Option<ApprovalOrchestrator>,
    audit: Option<Arc<AuditStore>>,
    discovery: Arc<DiscoveryPoller>,
    dispatcher: Arc<ProxyDispatcher>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProxyRuntime {
    /// Connect upstreams, start approval drivers, open the audit store and
    /// schedule background work. Any failure undoes what was started.
    pub async fn start(
        config: ProxyConfig,
        connector: &dyn Connector,
        drivers: HashMap<String, Arc<dyn NotificationDriver>>,
    ) -> Result<Self> {
        let registry = Arc::new(UpstreamRegistry::connect_all(&config, connector).await?);

        let orchestrator = if config.hitl.has_approval_tools() {
            let orchestrator = ApprovalOrchestrator::new(config.hitl.clone());
            for (name, driver) in drivers {
                orchestrator.register_driver(&name, driver);
            }
            if let Err(e) = orchestrator.start().await {
                registry.close().await;
                return Err(e);
            }
            Some(orchestrator)
        } else {
            if !drivers.is_empty() {
                info!("No tools require approval; destinations left idle");
            }
            None
        };

        let audit = if config.audit.enabled {
            match AuditStore::open(Path::new(&config.audit.db_path)) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    if let Some(o) = &orchestrator {
                        o.shutdown().await;
                    }
                    registry.close().await;
                    return Err(e.context("Failed to open audit store"));
                }
            }
        } else {
            warn!("Audit logging disabled");
            None
        };

        let dispatcher = Arc::new(ProxyDispatcher::new(
            registry.clone() as Arc<dyn ToolInvoker>,
            orchestrator
                .clone()
                .map(|o| Arc::new(o) as Arc<dyn ApprovalRequester>),
            audit.clone().map(|a| a as Arc<dyn AuditSink>),
        ));

        let discovery = Arc::new(DiscoveryPoller::new(registry.clone()));
        discovery.start(&config);

        let cleanup_task = audit
            .clone()
            .map(|store| spawn_cleanup(store, config.audit.retention_days));

        info!(
            upstreams = registry.len(),
            approvals = orchestrator.is_some(),
            audit = audit.is_some(),
            "Proxy runtime started"
        );

        Ok(Self {
            config,
            registry,
            orchestrator,
            audit,
            discovery,
            dispatcher,
            cleanup_task: Mutex::new(cleanup_task),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<ProxyDispatcher> {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> Arc<UpstreamRegistry> {
        self.registry.clone()
    }

    /// Externally visible tool listing, computed on every call
    pub fn catalog(&self) -> Arc<dyn ToolCatalog> {
        self.registry.clone()
    }

    pub fn discovery(&self) -> Arc<DiscoveryPoller> {
        self.discovery.clone()
    }

    pub fn audit(&self) -> Option<Arc<AuditStore>> {
        self.audit.clone()
    }

    pub fn pending_approvals(&self) -> usize {
        self.orchestrator
            .as_ref()
            .map(|o| o.pending_count())
            .unwrap_or(0)
    }

    /// Stop timers, reject pending approvals, let in-flight calls finish,
    /// then close upstreams and the audit store. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down proxy runtime");

        self.discovery.stop();
        let cleanup = match self.cleanup_task.lock() {
            Ok(mut t) => t.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(task) = cleanup {
            task.abort();
        }

        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.shutdown().await;
        }
        self.dispatcher.drain(DRAIN_GRACE).await;
        self.registry.close().await;
        if let Some(audit) = &self.audit {
            audit.close();
        }
        info!("Proxy runtime stopped");
    }
}

/// Prune expired audit rows now and then once a day
fn spawn_cleanup(store: Arc<AuditStore>, retention_days: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
        loop {
            ticker.tick().await;
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || store.cleanup(retention_days))
                .await
                .context("Audit cleanup task panicked")
                .and_then(|r| r);
            if let Err(e) = result {
                error!(error = %format!("{:#}", e), "Audit cleanup failed");
            }
        }
    })
}
