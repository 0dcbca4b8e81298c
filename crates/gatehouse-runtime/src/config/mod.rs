//! Typed proxy configuration.
//!
//! Built once at process start by the CLI loader and passed by reference into
//! every component constructor.

pub mod duration;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tool_policy::ToolAccessPolicy;

pub use duration::parse_duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
    pub mcps: BTreeMap<String, UpstreamConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    #[default]
    Stdio,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
    #[serde(default)]
    pub transport: ServerTransport,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on the HTTP endpoint (none = open)
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Optional approval overrides, used both per tool and per service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApprovalOverride {
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HitlConfig {
    #[serde(default = "default_destination")]
    pub default_destination: String,
    #[serde(default = "default_approval_timeout", with = "duration")]
    pub default_timeout: Duration,
    /// Service-level defaults, applied to that service's approval-required tools
    #[serde(default)]
    pub services: BTreeMap<String, ApprovalOverride>,
    /// `tools[service][tool]`: presence means the call needs approval
    #[serde(default)]
    pub tools: BTreeMap<String, BTreeMap<String, ApprovalOverride>>,
}

impl HitlConfig {
    pub fn requires_approval(&self, service_id: &str, tool_name: &str) -> bool {
        self.tool_override(service_id, tool_name).is_some()
    }

    pub fn tool_override(&self, service_id: &str, tool_name: &str) -> Option<&ApprovalOverride> {
        self.tools.get(service_id).and_then(|t| t.get(tool_name))
    }

    /// Resolve `(timeout, destination)`: per-tool, then per-service, then global
    pub fn resolve(&self, service_id: &str, tool_name: &str) -> (Duration, String) {
        let tool = self.tool_override(service_id, tool_name);
        let service = self.services.get(service_id);

        let timeout = tool
            .and_then(|t| t.timeout)
            .or_else(|| service.and_then(|s| s.timeout))
            .unwrap_or(self.default_timeout);
        let destination = tool
            .and_then(|t| t.destination.clone())
            .or_else(|| service.and_then(|s| s.destination.clone()))
            .unwrap_or_else(|| self.default_destination.clone());

        (timeout, destination)
    }

    pub fn has_approval_tools(&self) -> bool {
        self.tools.values().any(|tools| !tools.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DestinationConfig {
    Telegram(TelegramDestination),
}

impl DestinationConfig {
    pub fn driver_name(&self) -> &'static str {
        match self {
            DestinationConfig::Telegram(_) => "telegram",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramDestination {
    pub bot_token: String,
    #[serde(deserialize_with = "string_or_number")]
    pub chat_id: String,
    /// Bot API base URL override (self-hosted Bot API servers)
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamTransport {
    Stdio,
    /// Legacy HTTP+SSE: GET event stream plus POSTs to the announced endpoint
    Sse,
    #[serde(alias = "http")]
    StreamableHttp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Inferred from `command`/`url` when omitted
    #[serde(default)]
    pub transport: Option<UpstreamTransport>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tools: ToolAccessPolicy,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl UpstreamConfig {
    pub fn stdio(command: &str, args: &[&str]) -> Self {
        Self {
            transport: Some(UpstreamTransport::Stdio),
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            tools: ToolAccessPolicy::Wildcard,
            discovery: DiscoveryConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: ToolAccessPolicy) -> Self {
        self.tools = policy;
        self
    }

    /// Effective transport: explicit, else `command` => stdio, `url` => sse
    pub fn effective_transport(&self) -> Option<UpstreamTransport> {
        self.transport.or_else(|| {
            if self.command.is_some() {
                Some(UpstreamTransport::Stdio)
            } else if self.url.is_some() {
                Some(UpstreamTransport::Sse)
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
}

fn default_server_name() -> String {
    "gatehouse".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8808
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "./data/audit.db".to_string()
}

fn default_retention_days() -> u32 {
    90
}

fn default_destination() -> String {
    "default".to_string()
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(3 * 60 * 60)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Str(s) if s.is_empty() => Err(serde::de::Error::custom("chat_id must not be empty")),
        Raw::Str(s) => Ok(s),
        Raw::Int(n) => Ok(n.to_string()),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
            transport: ServerTransport::default(),
            host: default_host(),
            port: default_port(),
            auth_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            db_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            default_destination: default_destination(),
            default_timeout: default_approval_timeout(),
            services: BTreeMap::new(),
            tools: BTreeMap::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_poll_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hitl_with_overrides() -> HitlConfig {
        serde_json::from_value(json!({
            "default_destination": "default",
            "default_timeout": "3m",
            "services": {
                "jira-cloud": {"timeout": "5m", "destination": "jira-team"}
            },
            "tools": {
                "jira-cloud": {
                    "create_issue": {"timeout": "30s"},
                    "delete_issue": {}
                },
                "github": {
                    "merge_pr": {"destination": "ops"}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_prefers_tool_then_service_then_global() {
        let hitl = hitl_with_overrides();

        let (timeout, dest) = hitl.resolve("jira-cloud", "create_issue");
        assert_eq!(timeout, Duration::from_secs(30));
        assert_eq!(dest, "jira-team");

        let (timeout, dest) = hitl.resolve("jira-cloud", "delete_issue");
        assert_eq!(timeout, Duration::from_secs(300));
        assert_eq!(dest, "jira-team");

        let (timeout, dest) = hitl.resolve("github", "merge_pr");
        assert_eq!(timeout, Duration::from_secs(180));
        assert_eq!(dest, "ops");
    }

    #[test]
    fn test_requires_approval_is_presence_lookup() {
        let hitl = hitl_with_overrides();
        assert!(hitl.requires_approval("jira-cloud", "delete_issue"));
        assert!(!hitl.requires_approval("jira-cloud", "search"));
        assert!(!hitl.requires_approval("unknown", "create_issue"));
        assert!(hitl.has_approval_tools());
        assert!(!HitlConfig::default().has_approval_tools());
    }

    #[test]
    fn test_upstream_transport_inference() {
        let stdio: UpstreamConfig = serde_json::from_value(json!({"command": "npx"})).unwrap();
        assert_eq!(stdio.effective_transport(), Some(UpstreamTransport::Stdio));
        assert_eq!(stdio.tools, ToolAccessPolicy::Wildcard);
        assert!(!stdio.discovery.enabled);

        let bare_url: UpstreamConfig =
            serde_json::from_value(json!({"url": "https://mcp.example.com/sse"})).unwrap();
        assert_eq!(bare_url.effective_transport(), Some(UpstreamTransport::Sse));

        let streamable: UpstreamConfig = serde_json::from_value(
            json!({"transport": "streamable-http", "url": "https://mcp.example.com/mcp"}),
        )
        .unwrap();
        assert_eq!(
            streamable.effective_transport(),
            Some(UpstreamTransport::StreamableHttp)
        );
        let alias: UpstreamConfig =
            serde_json::from_value(json!({"transport": "http", "url": "https://x/mcp"})).unwrap();
        assert_eq!(alias.transport, Some(UpstreamTransport::StreamableHttp));
        assert!(serde_json::from_value::<UpstreamConfig>(json!({"transport": "ws"})).is_err());

        let neither: UpstreamConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(neither.effective_transport(), None);
    }

    #[test]
    fn test_telegram_chat_id_accepts_numbers() {
        let dest: DestinationConfig = serde_json::from_value(json!({
            "driver": "telegram",
            "bot_token": "123:abc",
            "chat_id": -100200300
        }))
        .unwrap();
        let DestinationConfig::Telegram(tg) = dest;
        assert_eq!(tg.chat_id, "-100200300");
    }

    #[test]
    fn test_defaults() {
        let config: ProxyConfig = serde_json::from_value(json!({"mcps": {}})).unwrap();
        assert_eq!(config.server.transport, ServerTransport::Stdio);
        assert!(config.audit.enabled);
        assert_eq!(config.audit.retention_days, 90);
        assert_eq!(config.hitl.default_timeout, Duration::from_secs(180));
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
