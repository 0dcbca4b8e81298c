use thiserror::Error;

/// Outcome errors of one proxied tool call.
///
/// The dispatcher turns every variant into an error result for the caller;
/// `DriverNotifyFailed` and `AuditWriteFailed` are only ever logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    #[error("Unknown upstream service: {0}")]
    UnknownUpstream(String),

    #[error("Tool \"{tool}\" is blocked by access control policy")]
    PolicyBlocked { service: String, tool: String },

    #[error("Tool call \"{tool}\" was rejected by {decided_by}")]
    ApprovalRejected { tool: String, decided_by: String },

    #[error("Tool call \"{tool}\" timed out waiting for approval")]
    ApprovalTimedOut { tool: String },

    #[error("Approval destination not found: {0}")]
    UnknownDestination(String),

    #[error("Approval request could not be delivered: {0}")]
    ApprovalFailed(String),

    #[error("Approval orchestrator is shutting down")]
    ShuttingDown,

    #[error("Error calling {service}.{tool}: {message}")]
    UpstreamCallFailed {
        service: String,
        tool: String,
        message: String,
    },

    #[error("Failed to update approval message: {0}")]
    DriverNotifyFailed(String),

    #[error("Failed to write audit record: {0}")]
    AuditWriteFailed(String),
}

impl ProxyError {
    /// Errors raised by the approval machinery itself rather than by a human
    pub fn is_approval_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::UnknownDestination(_)
                | ProxyError::ApprovalFailed(_)
                | ProxyError::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_tool_and_decider() {
        let err = ProxyError::ApprovalRejected {
            tool: "create_issue".into(),
            decided_by: "alice".into(),
        };
        assert_eq!(err.to_string(), "Tool call \"create_issue\" was rejected by alice");

        let err = ProxyError::ApprovalTimedOut {
            tool: "create_issue".into(),
        };
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_approval_failure_classification() {
        assert!(ProxyError::UnknownDestination("ops".into()).is_approval_failure());
        assert!(ProxyError::ShuttingDown.is_approval_failure());
        assert!(!ProxyError::InvalidToolName("x".into()).is_approval_failure());
    }
}
