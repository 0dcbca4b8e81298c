//! Human-in-the-loop approval: driver contract and the orchestrator that
//! tracks every in-flight request.

pub mod driver;
pub mod orchestrator;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ProxyError;

pub use driver::{
    ApprovalDecision, ApprovalOutcome, ApprovalRequest, DecisionCallback, DecisionEvent,
    MessageUpdate, NotificationDriver, DECIDER_ERROR, DECIDER_SHUTDOWN, DECIDER_SYSTEM,
};
pub use orchestrator::ApprovalOrchestrator;

/// What the dispatcher knows about a call that needs sign-off
#[derive(Debug, Clone, Default)]
pub struct ApprovalParams {
    pub service_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub agent: Option<String>,
    pub reason: Option<String>,
    pub content: Option<String>,
}

/// Narrow view of the orchestrator used by the dispatcher
#[async_trait]
pub trait ApprovalRequester: Send + Sync {
    /// Pure config lookup, no I/O
    fn requires_approval(&self, service_id: &str, tool_name: &str) -> bool;

    /// Wait for a terminal decision on this call
    async fn request_approval(&self, params: ApprovalParams)
        -> Result<ApprovalOutcome, ProxyError>;
}
