pub mod audit;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod hitl;
pub mod naming;
pub mod protocol;
pub mod runtime;
pub mod tool;
pub mod tool_policy;
pub mod upstream;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

pub use audit::{AuditDecision, AuditEntry, AuditQuery, AuditRecord, AuditSink, AuditStore};
pub use config::{LogFormat, ProxyConfig};
pub use discovery::{CatalogChange, DiscoveryPoller, ServiceDiff};
pub use dispatcher::ProxyDispatcher;
pub use error::ProxyError;
pub use hitl::{
    ApprovalDecision, ApprovalOrchestrator, ApprovalOutcome, ApprovalRequest, ApprovalRequester,
    DecisionCallback, DecisionEvent, MessageUpdate, NotificationDriver,
};
pub use runtime::ProxyRuntime;
pub use tool::{CallToolResult, ToolCatalog, ToolDescriptor, ToolInvoker};
pub use tool_policy::{AccessDecision, ToolAccessPolicy};
pub use upstream::{Connector, UpstreamConnection, UpstreamRegistry, UpstreamService};

/// Initialize logging on stderr. `RUST_LOG` overrides the configured level.
pub fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);

    // A subscriber may already be installed (tests, embedding)
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
