use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::audit::{AuditDecision, AuditEntry, AuditSink};
use crate::error::ProxyError;
use crate::hitl::{ApprovalDecision, ApprovalParams, ApprovalRequester, DECIDER_ERROR, DECIDER_SYSTEM};
use crate::naming;
use crate::tool::{CallToolResult, ToolInvoker};

/// Argument keys carrying call metadata for the approver. Never forwarded.
pub const AGENT_FIELD: &str = "_agent";
pub const REASON_FIELD: &str = "_reason";
pub const CONTENT_FIELD: &str = "_content";

/// Metadata pulled out of the call arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMetadata {
    pub agent: Option<String>,
    pub reason: Option<String>,
    pub content: Option<String>,
}

/// Remove the reserved metadata fields from `arguments`
pub fn extract_metadata(arguments: &mut Map<String, Value>) -> CallMetadata {
    let mut take = |key: &str| {
        arguments.remove(key).and_then(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    };
    CallMetadata {
        agent: take(AGENT_FIELD),
        reason: take(REASON_FIELD),
        content: take(CONTENT_FIELD),
    }
}

/// Routes one tool call through policy, approval, upstream and audit.
pub struct ProxyDispatcher {
    invoker: Arc<dyn ToolInvoker>,
    approvals: Option<Arc<dyn ApprovalRequester>>,
    audit: Option<Arc<dyn AuditSink>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts one call as in flight until dropped
struct InFlightGuard<'a> {
    dispatcher: &'a ProxyDispatcher,
}

impl<'a> InFlightGuard<'a> {
    fn enter(dispatcher: &'a ProxyDispatcher) -> Self {
        dispatcher.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { dispatcher }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.dispatcher.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.dispatcher.idle.notify_waiters();
        }
    }
}

/// Everything needed to write the audit row for one resolved call
struct CallRecord<'a> {
    service_id: &'a str,
    tool_name: &'a str,
    arguments: &'a Map<String, Value>,
    metadata: &'a CallMetadata,
    started_at: Instant,
}

impl ProxyDispatcher {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        approvals: Option<Arc<dyn ApprovalRequester>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        Self {
            invoker,
            approvals,
            audit,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Calls currently being handled
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no call is in flight, or until `grace` elapses.
    /// Returns false on timeout.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(grace, wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(in_flight = self.in_flight(), "Calls still in flight after drain period");
                false
            }
        }
    }

    /// Handle one `tools/call`. Never fails: every error becomes an error result.
    pub async fn handle_call(
        &self,
        composite_name: &str,
        mut arguments: Map<String, Value>,
    ) -> CallToolResult {
        let _guard = InFlightGuard::enter(self);
        let started_at = Instant::now();

        let Some((service_id, tool_name)) = naming::decompose(composite_name) else {
            warn!(tool = composite_name, "Call with invalid tool name");
            return ProxyError::InvalidToolName(composite_name.to_string()).into();
        };

        let Some(policy) = self.invoker.access_policy(service_id) else {
            warn!(service = service_id, tool = tool_name, "Call to unknown upstream");
            return ProxyError::UnknownUpstream(service_id.to_string()).into();
        };

        if !policy.evaluate(tool_name).is_allowed() {
            info!(service = service_id, tool = tool_name, "Tool call blocked by policy");
            let metadata = CallMetadata::default();
            let call = CallRecord {
                service_id,
                tool_name,
                arguments: &arguments,
                metadata: &metadata,
                started_at,
            };
            self.audit(&call, AuditDecision::Blocked, DECIDER_SYSTEM).await;
            return ProxyError::PolicyBlocked {
                service: service_id.to_string(),
                tool: tool_name.to_string(),
            }
            .into();
        }

        let metadata = extract_metadata(&mut arguments);
        let call = CallRecord {
            service_id,
            tool_name,
            arguments: &arguments,
            metadata: &metadata,
            started_at,
        };

        let mut approver = None;
        if let Some(approvals) = &self.approvals {
            if approvals.requires_approval(service_id, tool_name) {
                info!(service = service_id, tool = tool_name, "Tool call requires approval");
                let params = ApprovalParams {
                    service_id: service_id.to_string(),
                    tool_name: tool_name.to_string(),
                    arguments: arguments.clone(),
                    agent: metadata.agent.clone(),
                    reason: metadata.reason.clone(),
                    content: metadata.content.clone(),
                };
                match approvals.request_approval(params).await {
                    Ok(outcome) => match outcome.decision {
                        ApprovalDecision::Approved => {
                            info!(
                                service = service_id,
                                tool = tool_name,
                                decided_by = %outcome.decided_by,
                                "Tool call approved"
                            );
                            approver = Some(outcome.decided_by);
                        }
                        ApprovalDecision::Rejected => {
                            self.audit(&call, AuditDecision::Rejected, &outcome.decided_by)
                                .await;
                            return ProxyError::ApprovalRejected {
                                tool: tool_name.to_string(),
                                decided_by: outcome.decided_by,
                            }
                            .into();
                        }
                        ApprovalDecision::Timeout => {
                            self.audit(&call, AuditDecision::Timeout, &outcome.decided_by)
                                .await;
                            return ProxyError::ApprovalTimedOut {
                                tool: tool_name.to_string(),
                            }
                            .into();
                        }
                    },
                    Err(e) => {
                        error!(service = service_id, tool = tool_name, error = %e, "Approval failed");
                        self.audit(&call, AuditDecision::Rejected, DECIDER_ERROR).await;
                        return e.into();
                    }
                }
            }
        }

        match self
            .invoker
            .invoke(service_id, tool_name, arguments.clone())
            .await
        {
            Ok(result) => {
                match &approver {
                    Some(decided_by) => {
                        self.audit(&call, AuditDecision::Approved, decided_by).await
                    }
                    None => {
                        self.audit(&call, AuditDecision::Passthrough, DECIDER_SYSTEM)
                            .await
                    }
                }
                CallToolResult::from_upstream(result)
            }
            Err(e) => {
                error!(service = service_id, tool = tool_name, error = %e, "Upstream tool call failed");
                self.audit(&call, AuditDecision::Error, DECIDER_SYSTEM).await;
                e.into()
            }
        }
    }

    /// Write one audit row off the async workers. Failures are logged only.
    async fn audit(&self, call: &CallRecord<'_>, decision: AuditDecision, decided_by: &str) {
        let Some(sink) = self.audit.clone() else {
            return;
        };
        let entry = AuditEntry {
            agent: call.metadata.agent.clone(),
            service_id: call.service_id.to_string(),
            tool_name: call.tool_name.to_string(),
            params: serde_json::to_string(call.arguments).ok(),
            reason: call.metadata.reason.clone(),
            content: call.metadata.content.clone(),
            decision,
            decided_by: decided_by.to_string(),
            latency_ms: Some(call.started_at.elapsed().as_millis() as u64),
        };

        let written = tokio::task::spawn_blocking(move || sink.record(&entry)).await;
        let err = match written {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(join) => ProxyError::AuditWriteFailed(join.to_string()),
        };
        error!(
            service = call.service_id,
            tool = call.tool_name,
            decision = %decision,
            error = %err,
            "Audit write failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::ApprovalOutcome;
    use crate::test_support::{MemoryAuditSink, ScriptedApprovals};
    use crate::tool_policy::ToolAccessPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeInvoker {
        calls: Mutex<Vec<(String, String, Map<String, Value>)>>,
        fail: bool,
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        fn access_policy(&self, service_id: &str) -> Option<ToolAccessPolicy> {
            match service_id {
                "github" => Some(ToolAccessPolicy::block(["delete_repo"])),
                "jira" => Some(ToolAccessPolicy::Wildcard),
                _ => None,
            }
        }

        async fn invoke(
            &self,
            service_id: &str,
            tool_name: &str,
            arguments: Map<String, Value>,
        ) -> Result<Value, ProxyError> {
            self.calls.lock().unwrap().push((
                service_id.to_string(),
                tool_name.to_string(),
                arguments,
            ));
            if self.fail {
                return Err(ProxyError::UpstreamCallFailed {
                    service: service_id.into(),
                    tool: tool_name.into(),
                    message: "boom".into(),
                });
            }
            Ok(json!({"content": [{"type": "text", "text": "ok"}]}))
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn dispatcher(
        invoker: Arc<FakeInvoker>,
        approvals: Option<Arc<ScriptedApprovals>>,
        audit: &Arc<MemoryAuditSink>,
    ) -> ProxyDispatcher {
        ProxyDispatcher::new(
            invoker,
            approvals.map(|a| a as Arc<dyn ApprovalRequester>),
            Some(audit.clone() as Arc<dyn AuditSink>),
        )
    }

    #[test]
    fn test_extract_metadata_strips_reserved_fields() {
        let mut arguments = args(json!({
            "_agent": "claude", "_reason": "triage", "_content": 42, "q": "bug"
        }));
        let meta = extract_metadata(&mut arguments);
        assert_eq!(meta.agent.as_deref(), Some("claude"));
        assert_eq!(meta.reason.as_deref(), Some("triage"));
        assert_eq!(meta.content.as_deref(), Some("42"));
        assert_eq!(arguments, args(json!({"q": "bug"})));
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_names_are_not_audited() {
        let audit = MemoryAuditSink::new();
        let d = dispatcher(Arc::new(FakeInvoker::default()), None, &audit);

        let result = d.handle_call("search", Map::new()).await;
        assert!(result.is_error());
        assert_eq!(result.text_content(), "Invalid tool name: search");

        let result = d.handle_call("confluence__search", Map::new()).await;
        assert!(result.is_error());
        assert_eq!(result.text_content(), "Unknown upstream service: confluence");

        assert!(audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_call_is_audited_and_not_forwarded() {
        let invoker = Arc::new(FakeInvoker::default());
        let audit = MemoryAuditSink::new();
        let d = dispatcher(invoker.clone(), None, &audit);

        let result = d.handle_call("github__delete_repo", Map::new()).await;
        assert!(result.is_error());
        assert!(result.text_content().contains("blocked"));
        assert!(invoker.calls.lock().unwrap().is_empty());

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, AuditDecision::Blocked);
        assert_eq!(entries[0].decided_by, "system");
    }

    #[tokio::test]
    async fn test_passthrough_forwards_clean_arguments() {
        let invoker = Arc::new(FakeInvoker::default());
        let audit = MemoryAuditSink::new();
        let d = dispatcher(invoker.clone(), None, &audit);

        let result = d
            .handle_call(
                "github__list_repos",
                args(json!({"org": "acme", "_agent": "claude"})),
            )
            .await;
        assert!(!result.is_error());
        assert_eq!(result.text_content(), "ok");

        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls[0].2, args(json!({"org": "acme"})));

        let entries = audit.entries();
        assert_eq!(entries[0].decision, AuditDecision::Passthrough);
        assert_eq!(entries[0].agent.as_deref(), Some("claude"));
        assert_eq!(entries[0].params.as_deref(), Some(r#"{"org":"acme"}"#));
    }

    #[tokio::test]
    async fn test_approved_call_records_decider() {
        let approvals = ScriptedApprovals::answering(Ok(ApprovalOutcome::new(
            ApprovalDecision::Approved,
            "alice",
        )));
        let audit = MemoryAuditSink::new();
        let d = dispatcher(
            Arc::new(FakeInvoker::default()),
            Some(approvals.clone()),
            &audit,
        );

        let result = d
            .handle_call("jira__create_issue", args(json!({"_reason": "ticket"})))
            .await;
        assert!(!result.is_error());

        let asked = approvals.requests();
        assert_eq!(asked[0].reason.as_deref(), Some("ticket"));
        assert!(asked[0].arguments.is_empty());

        let entries = audit.entries();
        assert_eq!(entries[0].decision, AuditDecision::Approved);
        assert_eq!(entries[0].decided_by, "alice");
    }

    #[tokio::test]
    async fn test_rejection_and_timeout_results() {
        let audit = MemoryAuditSink::new();
        let rejecting = dispatcher(
            Arc::new(FakeInvoker::default()),
            Some(ScriptedApprovals::answering(Ok(ApprovalOutcome::new(
                ApprovalDecision::Rejected,
                "bob",
            )))),
            &audit,
        );
        let result = rejecting.handle_call("jira__create_issue", Map::new()).await;
        assert_eq!(
            result.text_content(),
            "Tool call \"create_issue\" was rejected by bob"
        );

        let timing_out = dispatcher(
            Arc::new(FakeInvoker::default()),
            Some(ScriptedApprovals::answering(Ok(ApprovalOutcome::new(
                ApprovalDecision::Timeout,
                "system",
            )))),
            &audit,
        );
        let result = timing_out.handle_call("jira__create_issue", Map::new()).await;
        assert!(result.text_content().contains("timed out"));

        let decisions: Vec<_> = audit.entries().iter().map(|e| e.decision).collect();
        assert_eq!(decisions, vec![AuditDecision::Rejected, AuditDecision::Timeout]);
    }

    #[tokio::test]
    async fn test_approval_failure_audited_as_system_error() {
        let audit = MemoryAuditSink::new();
        let invoker = Arc::new(FakeInvoker::default());
        let d = dispatcher(
            invoker.clone(),
            Some(ScriptedApprovals::answering(Err(
                ProxyError::UnknownDestination("ops".into()),
            ))),
            &audit,
        );

        let result = d.handle_call("jira__create_issue", Map::new()).await;
        assert!(result.is_error());
        assert!(invoker.calls.lock().unwrap().is_empty());

        let entries = audit.entries();
        assert_eq!(entries[0].decision, AuditDecision::Rejected);
        assert_eq!(entries[0].decided_by, "system (error)");
    }

    #[tokio::test]
    async fn test_upstream_failure_audited_as_error() {
        let audit = MemoryAuditSink::new();
        let invoker = Arc::new(FakeInvoker {
            fail: true,
            ..Default::default()
        });
        let d = dispatcher(invoker, None, &audit);

        let result = d.handle_call("jira__search", Map::new()).await;
        assert!(result.is_error());
        assert_eq!(result.text_content(), "Error calling jira.search: boom");
        assert_eq!(audit.entries()[0].decision, AuditDecision::Error);
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_change_outcome() {
        let audit = MemoryAuditSink::new();
        audit.fail_writes();
        let d = dispatcher(Arc::new(FakeInvoker::default()), None, &audit);

        let result = d.handle_call("jira__search", Map::new()).await;
        assert!(!result.is_error());
    }
}
