use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::driver::{
    ApprovalDecision, ApprovalOutcome, ApprovalRequest, DecisionEvent, MessageUpdate,
    NotificationDriver, DECIDER_SHUTDOWN, DECIDER_SYSTEM,
};
use super::{ApprovalParams, ApprovalRequester};
use crate::config::HitlConfig;
use crate::error::ProxyError;

/// One request awaiting a human. Removing it from the pending map is the only
/// way to resolve it, which makes resolution happen exactly once.
struct PendingApproval {
    request: Arc<ApprovalRequest>,
    destination: String,
    message_ref: Option<String>,
    started_at: Instant,
    completion: oneshot::Sender<ApprovalOutcome>,
    timer: Option<JoinHandle<()>>,
}

/// Where a resolution came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Human,
    Timer,
    Shutdown,
}

/// A pending request whose prompt has not gone out yet
struct Registration {
    request: Arc<ApprovalRequest>,
    driver: Arc<dyn NotificationDriver>,
    started_at: Instant,
    completion: oneshot::Receiver<ApprovalOutcome>,
}

/// Message edit to push after a request was resolved
struct PendingUpdate {
    driver: Arc<dyn NotificationDriver>,
    message_ref: String,
    update: MessageUpdate,
}

struct Inner {
    hitl: HitlConfig,
    drivers: RwLock<HashMap<String, Arc<dyn NotificationDriver>>>,
    pending: DashMap<String, PendingApproval>,
    shutting_down: AtomicBool,
}

/// Tracks in-flight approval requests and races human decisions against
/// per-request timers.
#[derive(Clone)]
pub struct ApprovalOrchestrator {
    inner: Arc<Inner>,
}

impl ApprovalOrchestrator {
    pub fn new(hitl: HitlConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                hitl,
                drivers: RwLock::new(HashMap::new()),
                pending: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a driver under a destination name and subscribe to its decisions
    pub fn register_driver(&self, destination: &str, driver: Arc<dyn NotificationDriver>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        driver.on_decision(Arc::new(move |event: DecisionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_decision(event);
            }
        }));

        info!(destination, driver = driver.kind(), "Approval destination registered");
        match self.inner.drivers.write() {
            Ok(mut drivers) => drivers.insert(destination.to_string(), driver),
            Err(e) => e.into_inner().insert(destination.to_string(), driver),
        };
    }

    /// Start every registered driver. A driver that fails to start is fatal;
    /// drivers already started are closed again.
    pub async fn start(&self) -> Result<()> {
        let mut drivers = self.inner.driver_list();
        drivers.sort_by(|a, b| a.0.cmp(&b.0));

        let mut started: Vec<Arc<dyn NotificationDriver>> = Vec::new();
        for (name, driver) in drivers {
            if let Err(e) = driver.start().await {
                for d in &started {
                    if let Err(close_err) = d.close().await {
                        warn!(error = %close_err, "Failed to close driver after startup error");
                    }
                }
                return Err(e).with_context(|| format!("Failed to start destination '{}'", name));
            }
            info!(destination = %name, driver = driver.kind(), "Approval destination started");
            started.push(driver);
        }
        Ok(())
    }

    pub fn requires_approval(&self, service_id: &str, tool_name: &str) -> bool {
        self.inner.hitl.requires_approval(service_id, tool_name)
    }

    /// Number of requests still waiting for a decision
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Ask a human and wait for the decision, the timeout, or shutdown.
    pub async fn request_approval(
        &self,
        params: ApprovalParams,
    ) -> Result<ApprovalOutcome, ProxyError> {
        let registration = self.register(params)?;
        self.prompt(registration).await
    }

    /// Put a request in the pending map before any prompt goes out, so a fast
    /// decision finds it.
    fn register(&self, params: ApprovalParams) -> Result<Registration, ProxyError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ProxyError::ShuttingDown);
        }

        let (timeout, destination) = inner.hitl.resolve(&params.service_id, &params.tool_name);
        let driver = inner
            .driver(&destination)
            .ok_or_else(|| ProxyError::UnknownDestination(destination.clone()))?;

        let request = Arc::new(ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            service_id: params.service_id,
            tool_name: params.tool_name,
            arguments: params.arguments,
            agent: params.agent,
            reason: params.reason,
            content: params.content,
            timeout,
        });
        let started_at = Instant::now();
        let (tx, rx) = oneshot::channel();

        inner.pending.insert(
            request.id.clone(),
            PendingApproval {
                request: request.clone(),
                destination: destination.clone(),
                message_ref: None,
                started_at,
                completion: tx,
                timer: None,
            },
        );
        info!(
            request_id = %request.id,
            service = %request.service_id,
            tool = %request.tool_name,
            destination = %destination,
            timeout_ms = timeout.as_millis() as u64,
            "Approval requested"
        );

        // Shutdown may have drained the map between the flag check and insert
        if inner.shutting_down.load(Ordering::SeqCst) {
            inner.resolve(
                &request.id,
                ApprovalDecision::Rejected,
                DECIDER_SHUTDOWN,
                Source::Shutdown,
            );
        }

        Ok(Registration {
            request,
            driver,
            started_at,
            completion: rx,
        })
    }

    /// Send the prompt, arm the timer and wait for the outcome
    async fn prompt(&self, registration: Registration) -> Result<ApprovalOutcome, ProxyError> {
        let inner = &self.inner;
        let Registration {
            request,
            driver,
            started_at,
            completion,
        } = registration;
        let id = request.id.clone();

        // Only shutdown resolves a request before its prompt exists; the
        // driver may already be closing
        if !inner.pending.contains_key(&id) {
            debug!(request_id = %id, "Approval resolved before the prompt was sent");
            return completion.await.map_err(|_| ProxyError::ShuttingDown);
        }

        let mut late_ref = None;
        match driver.send_request(&request).await {
            Ok(message_ref) => {
                if !inner.arm(&id, &message_ref, request.timeout) {
                    // Resolved while the prompt was in flight; edit it once we know how
                    late_ref = Some(message_ref);
                }
            }
            Err(e) => {
                if inner.pending.remove(&id).is_some() {
                    error!(request_id = %id, error = %e, "Failed to send approval request");
                    return Err(ProxyError::ApprovalFailed(format!("{:#}", e)));
                }
                warn!(request_id = %id, error = %e, "Approval prompt failed after resolution");
            }
        }

        let outcome = completion.await.map_err(|_| ProxyError::ShuttingDown)?;

        if let Some(message_ref) = late_ref {
            let update = MessageUpdate {
                decision: outcome.decision,
                decided_by: outcome.decided_by.clone(),
                elapsed: started_at.elapsed(),
            };
            push_update(PendingUpdate {
                driver,
                message_ref,
                update,
            })
            .await;
        }

        Ok(outcome)
    }

    /// Reject every pending request, wait for their message edits, then close
    /// the drivers. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids: Vec<String> = inner.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Rejecting pending approvals for shutdown");
        }
        let updates: Vec<_> = ids
            .iter()
            .filter_map(|id| {
                inner.resolve(id, ApprovalDecision::Rejected, DECIDER_SHUTDOWN, Source::Shutdown)
            })
            .map(push_update)
            .collect();
        futures::future::join_all(updates).await;

        let drivers = match inner.drivers.write() {
            Ok(mut d) => std::mem::take(&mut *d),
            Err(e) => std::mem::take(&mut *e.into_inner()),
        };
        for (name, driver) in drivers {
            match driver.close().await {
                Ok(()) => debug!(destination = %name, "Approval destination closed"),
                Err(e) => warn!(destination = %name, error = %e, "Error closing destination"),
            }
        }
    }
}

impl Inner {
    fn driver(&self, destination: &str) -> Option<Arc<dyn NotificationDriver>> {
        match self.drivers.read() {
            Ok(d) => d.get(destination).cloned(),
            Err(e) => e.into_inner().get(destination).cloned(),
        }
    }

    fn driver_list(&self) -> Vec<(String, Arc<dyn NotificationDriver>)> {
        let clone = |d: &HashMap<String, Arc<dyn NotificationDriver>>| {
            d.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        match self.drivers.read() {
            Ok(d) => clone(&d),
            Err(e) => clone(&e.into_inner()),
        }
    }

    /// Record the sent message and start the timeout. Returns false when the
    /// request was already resolved.
    fn arm(self: &Arc<Self>, id: &str, message_ref: &str, timeout: Duration) -> bool {
        let Some(mut entry) = self.pending.get_mut(id) else {
            return false;
        };
        entry.message_ref = Some(message_ref.to_string());

        let weak = Arc::downgrade(self);
        let timer_id = id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Some(update) =
                inner.resolve(&timer_id, ApprovalDecision::Timeout, DECIDER_SYSTEM, Source::Timer)
            {
                push_update(update).await;
            }
        }));
        true
    }

    fn handle_decision(&self, event: DecisionEvent) {
        let resolved = self.resolve(
            &event.request_id,
            event.decision,
            &event.decided_by,
            Source::Human,
        );
        match resolved {
            Some(update) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(push_update(update));
                }
                Err(_) => warn!(
                    request_id = %event.request_id,
                    "No runtime available to update approval message"
                ),
            },
            None => debug!(
                request_id = %event.request_id,
                "Decision for unknown or already resolved request"
            ),
        }
    }

    /// Take the entry out of the pending map and complete its waiter. Returns
    /// the message edit to push when a message reference is known.
    fn resolve(
        &self,
        id: &str,
        decision: ApprovalDecision,
        decided_by: &str,
        source: Source,
    ) -> Option<PendingUpdate> {
        let (_, entry) = self.pending.remove(id)?;

        if source != Source::Timer {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }

        let elapsed = entry.started_at.elapsed();
        info!(
            request_id = %id,
            service = %entry.request.service_id,
            tool = %entry.request.tool_name,
            decision = %decision,
            decided_by,
            elapsed_ms = elapsed.as_millis() as u64,
            "Approval resolved"
        );

        let outcome = ApprovalOutcome::new(decision, decided_by);
        if entry.completion.send(outcome).is_err() {
            debug!(request_id = %id, "Approval waiter already gone");
        }

        let message_ref = entry.message_ref?;
        let driver = self.driver(&entry.destination)?;
        Some(PendingUpdate {
            driver,
            message_ref,
            update: MessageUpdate {
                decision,
                decided_by: decided_by.to_string(),
                elapsed,
            },
        })
    }
}

async fn push_update(pending: PendingUpdate) {
    if let Err(e) = pending
        .driver
        .update_message(&pending.message_ref, &pending.update)
        .await
    {
        let err = ProxyError::DriverNotifyFailed(format!("{:#}", e));
        warn!(message_ref = %pending.message_ref, error = %err, "Failed to update approval message");
    }
}

#[async_trait]
impl ApprovalRequester for ApprovalOrchestrator {
    fn requires_approval(&self, service_id: &str, tool_name: &str) -> bool {
        ApprovalOrchestrator::requires_approval(self, service_id, tool_name)
    }

    async fn request_approval(
        &self,
        params: ApprovalParams,
    ) -> Result<ApprovalOutcome, ProxyError> {
        ApprovalOrchestrator::request_approval(self, params).await
    }
}
