//! In-process fakes for upstreams, notification drivers, approvals and audit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::audit::{AuditEntry, AuditSink};
use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::hitl::{
    ApprovalDecision, ApprovalOutcome, ApprovalParams, ApprovalRequest, ApprovalRequester,
    DecisionCallback, DecisionEvent, MessageUpdate, NotificationDriver,
};
use crate::tool::ToolDescriptor;
use crate::upstream::{Connector, UpstreamConnection};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Upstream connection with a mutable catalog that echoes calls back
#[derive(Default)]
pub struct FakeConnection {
    tools: Mutex<Vec<ToolDescriptor>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    call_error: Mutex<Option<String>>,
    fail_list: AtomicBool,
    list_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl FakeConnection {
    pub fn with_tools(names: &[&str]) -> Arc<Self> {
        let conn = Arc::new(Self::default());
        conn.set_tools(names);
        conn
    }

    pub fn set_tools(&self, names: &[&str]) {
        *lock(&self.tools) = names
            .iter()
            .map(|n| ToolDescriptor::new(n, &format!("{} tool", n)))
            .collect();
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        lock(&self.tools).clone()
    }

    pub fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        lock(&self.calls).clone()
    }

    pub fn fail_calls(&self, message: &str) {
        *lock(&self.call_error) = Some(message.to_string());
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn list_count(&self) -> usize {
        self.list_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            bail!("tools/list unavailable");
        }
        Ok(self.tools())
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Value> {
        lock(&self.calls).push((name.to_string(), arguments.clone()));
        if let Some(message) = lock(&self.call_error).clone() {
            bail!(message);
        }
        Ok(json!({
            "content": [{"type": "text", "text": format!("{} done", name)}],
            "structuredContent": {"arguments": arguments}
        }))
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built fake connections by service id
#[derive(Default)]
pub struct FakeConnector {
    connections: HashMap<String, Arc<FakeConnection>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service_id: &str, connection: Arc<FakeConnection>) -> Self {
        self.connections.insert(service_id.to_string(), connection);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        service_id: &str,
        _config: &UpstreamConfig,
    ) -> Result<Arc<dyn UpstreamConnection>> {
        let conn = self
            .connections
            .get(service_id)
            .cloned()
            .ok_or_else(|| anyhow!("connection refused: {}", service_id))?;
        Ok(conn)
    }
}

/// Scripted notification driver. Decisions are injected with [`MockDriver::decide`].
#[derive(Default)]
pub struct MockDriver {
    callback: Mutex<Option<DecisionCallback>>,
    sent: Mutex<Vec<ApprovalRequest>>,
    updates: Mutex<Vec<(String, MessageUpdate)>>,
    events: Mutex<Vec<String>>,
    decide_during_send: Mutex<Option<(ApprovalDecision, String)>>,
    fail_sends: AtomicBool,
    fail_start: AtomicBool,
    started: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Answer every prompt before `send_request` even returns
    pub fn decide_during_send(&self, decision: ApprovalDecision, decided_by: &str) {
        *lock(&self.decide_during_send) = Some((decision, decided_by.to_string()));
    }

    pub fn decide(&self, request_id: &str, decision: ApprovalDecision, decided_by: &str) {
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(DecisionEvent {
                request_id: request_id.to_string(),
                decision,
                decided_by: decided_by.to_string(),
            });
        }
    }

    pub fn sent(&self) -> Vec<ApprovalRequest> {
        lock(&self.sent).clone()
    }

    pub fn updates(&self) -> Vec<(String, MessageUpdate)> {
        lock(&self.updates).clone()
    }

    /// `start`, `update:<ref>` and `close` in the order they happened
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationDriver for MockDriver {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            bail!("mock driver refused to start");
        }
        self.started.store(true, Ordering::SeqCst);
        lock(&self.events).push("start".to_string());
        Ok(())
    }

    async fn send_request(&self, request: &ApprovalRequest) -> Result<String> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("mock send failure");
        }
        let message_ref = {
            let mut sent = lock(&self.sent);
            sent.push(request.clone());
            format!("msg-{}", sent.len())
        };
        let instant = lock(&self.decide_during_send).clone();
        if let Some((decision, decided_by)) = instant {
            self.decide(&request.id, decision, &decided_by);
        }
        Ok(message_ref)
    }

    async fn update_message(&self, message_ref: &str, update: &MessageUpdate) -> Result<()> {
        lock(&self.updates).push((message_ref.to_string(), update.clone()));
        lock(&self.events).push(format!("update:{}", message_ref));
        Ok(())
    }

    fn on_decision(&self, callback: DecisionCallback) {
        *lock(&self.callback) = Some(callback);
    }

    async fn close(&self) -> Result<()> {
        lock(&self.events).push("close".to_string());
        Ok(())
    }
}

/// Approval requester that answers every request the same way
pub struct ScriptedApprovals {
    answer: Result<ApprovalOutcome, ProxyError>,
    requests: Mutex<Vec<ApprovalParams>>,
}

impl ScriptedApprovals {
    pub fn answering(answer: Result<ApprovalOutcome, ProxyError>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ApprovalParams> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ApprovalRequester for ScriptedApprovals {
    fn requires_approval(&self, _service_id: &str, _tool_name: &str) -> bool {
        true
    }

    async fn request_approval(
        &self,
        params: ApprovalParams,
    ) -> Result<ApprovalOutcome, ProxyError> {
        lock(&self.requests).push(params);
        self.answer.clone()
    }
}

/// Audit sink keeping entries in memory
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    fail: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), ProxyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProxyError::AuditWriteFailed("disk full".into()));
        }
        lock(&self.entries).push(entry.clone());
        Ok(())
    }
}
