use anyhow::Result;
use gatehouse_runtime::{Connector, DiscoveryPoller, ProxyConfig, ServiceDiff, UpstreamRegistry};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
    /// Every tool with its access and approval markers
    Catalog,
    /// Allowed / blocked / approval-required per service
    Diff,
}

pub async fn execute(config: &ProxyConfig, connector: &dyn Connector, report: Report) -> Result<()> {
    print!("{}", run(config, connector, report).await?);
    Ok(())
}

/// Connect, refresh every catalog, render the report, disconnect
pub async fn run(config: &ProxyConfig, connector: &dyn Connector, report: Report) -> Result<String> {
    let registry = Arc::new(UpstreamRegistry::connect_all(config, connector).await?);
    let poller = DiscoveryPoller::new(registry.clone());
    let tools = poller.discover_all().await;

    let output = match report {
        Report::Catalog => render_catalog(config, &tools),
        Report::Diff => render_diff(&poller.diff(&config.hitl)),
    };
    registry.close().await;
    Ok(output)
}

pub fn render_catalog(config: &ProxyConfig, tools: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for (service_id, names) in tools {
        let _ = writeln!(out, "\n📦 {} ({} tools):", service_id, names.len());
        let policy = config.mcps.get(service_id).map(|m| &m.tools);
        for name in names {
            let allowed = policy.map_or(true, |p| p.evaluate(name).is_allowed());
            let icon = if allowed { "✅" } else { "🚫" };
            let approval = if config.hitl.requires_approval(service_id, name) {
                " 🔔 approval"
            } else {
                ""
            };
            let _ = writeln!(out, "  {} {}{}", icon, name, approval);
        }
    }
    out
}

pub fn render_diff(diffs: &[ServiceDiff]) -> String {
    let mut out = String::new();
    for diff in diffs {
        let _ = writeln!(out, "\n📦 {}:", diff.service_id);
        let _ = writeln!(out, "  ✅ Allowed: {}", diff.allowed.len());
        for name in &diff.allowed {
            let bell = if diff.approval_required.contains(name) { " 🔔" } else { "" };
            let _ = writeln!(out, "     {}{}", name, bell);
        }
        if !diff.blocked.is_empty() {
            let _ = writeln!(out, "  🚫 Blocked: {}", diff.blocked.len());
            for name in &diff.blocked {
                let _ = writeln!(out, "     {}", name);
            }
        }
        if !diff.approval_required.is_empty() {
            let _ = writeln!(out, "  🔔 Approval: {}", diff.approval_required.join(", "));
        }
    }
    out
}
