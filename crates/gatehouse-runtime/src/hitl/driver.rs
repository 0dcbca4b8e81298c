use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decider identity for timer-driven resolutions
pub const DECIDER_SYSTEM: &str = "system";
/// Decider identity for requests force-rejected at shutdown
pub const DECIDER_SHUTDOWN: &str = "system (shutdown)";
/// Decider identity when the approval machinery itself failed
pub const DECIDER_ERROR: &str = "system (error)";

/// Terminal state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
            ApprovalDecision::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision plus who made it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub decision: ApprovalDecision,
    pub decided_by: String,
}

impl ApprovalOutcome {
    pub fn new(decision: ApprovalDecision, decided_by: impl Into<String>) -> Self {
        Self {
            decision,
            decided_by: decided_by.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.decision == ApprovalDecision::Approved
    }
}

/// Prompt pushed to a human channel
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub service_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub agent: Option<String>,
    pub reason: Option<String>,
    pub content: Option<String>,
    pub timeout: Duration,
}

/// Final state pushed back onto the original message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub decision: ApprovalDecision,
    pub decided_by: String,
    pub elapsed: Duration,
}

/// Human decision delivered asynchronously by a driver
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEvent {
    pub request_id: String,
    pub decision: ApprovalDecision,
    pub decided_by: String,
}

pub type DecisionCallback = Arc<dyn Fn(DecisionEvent) + Send + Sync>;

/// A human notification channel (chat bot, email, web UI, ...).
///
/// The orchestrator registers exactly one decision callback before `start`.
#[async_trait]
pub trait NotificationDriver: Send + Sync {
    /// Driver kind for logging
    fn kind(&self) -> &str;

    /// Begin listening for decisions
    async fn start(&self) -> Result<()>;

    /// Push a new approval prompt, returning a reference to the sent message.
    /// Called concurrently for unrelated requests.
    async fn send_request(&self, request: &ApprovalRequest) -> Result<String>;

    /// Edit the prompt to show the final outcome. Best-effort.
    async fn update_message(&self, message_ref: &str, update: &MessageUpdate) -> Result<()>;

    fn on_decision(&self, callback: DecisionCallback);

    /// Stop listening and release resources
    async fn close(&self) -> Result<()>;
}
