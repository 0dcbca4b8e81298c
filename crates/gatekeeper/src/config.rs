use anyhow::{bail, Context, Result};
use gatehouse_runtime::config::{ServerTransport, UpstreamTransport};
use gatehouse_runtime::naming;
use gatehouse_runtime::ProxyConfig;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("invalid regex"));

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Load, substitute, parse and validate a config file
pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let config = parse_file(path)?;
    let errors = validate(&config);
    if !errors.is_empty() {
        bail!(
            "Invalid config {}:\n  - {}",
            path.display(),
            errors.join("\n  - ")
        );
    }
    Ok(config)
}

pub fn parse_file(path: &Path) -> Result<ProxyConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<ProxyConfig> {
    let mut value: toml::Value = toml::from_str(content).context("Failed to parse TOML config")?;
    substitute_env(&mut value, &|name| std::env::var(name).ok());
    let mut config: ProxyConfig = value.try_into().context("Invalid config structure")?;
    config.audit.db_path = shellexpand::tilde(&config.audit.db_path).into_owned();
    Ok(config)
}

/// Replace `${VAR}` inside every string value. Unset variables stay verbatim.
pub fn substitute_env(value: &mut toml::Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        toml::Value::String(s) => {
            if ENV_REF.is_match(s) {
                *s = ENV_REF
                    .replace_all(s, |caps: &regex::Captures| match lookup(&caps[1]) {
                        Some(v) => v,
                        None => {
                            warn!(var = &caps[1], "Environment variable is not set");
                            caps[0].to_string()
                        }
                    })
                    .into_owned();
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                substitute_env(item, lookup);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_env(item, lookup);
            }
        }
        _ => {}
    }
}

/// Every rule violation in the config, empty when valid
pub fn validate(config: &ProxyConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.mcps.is_empty() {
        errors.push("At least one MCP service must be configured under [mcps]".to_string());
    }
    for (id, upstream) in &config.mcps {
        if !naming::is_valid_service_id(id) {
            errors.push(format!(
                "Invalid service id {:?}: must be non-empty, must not contain \"{}\" and must not end with '_'",
                id,
                naming::SEPARATOR
            ));
        }
        match upstream.effective_transport() {
            Some(UpstreamTransport::Stdio) if upstream.command.is_none() => {
                errors.push(format!("mcps.{}: stdio transport requires 'command'", id));
            }
            Some(UpstreamTransport::Sse | UpstreamTransport::StreamableHttp)
                if upstream.url.is_none() =>
            {
                errors.push(format!("mcps.{}: http transport requires 'url'", id));
            }
            None => errors.push(format!("mcps.{}: set either 'command' or 'url'", id)),
            _ => {}
        }
        if upstream.discovery.enabled && upstream.discovery.poll_interval.is_zero() {
            errors.push(format!("mcps.{}: discovery poll_interval must be > 0", id));
        }
    }

    let hitl = &config.hitl;
    for id in hitl.services.keys().chain(hitl.tools.keys()) {
        if !config.mcps.contains_key(id) {
            errors.push(format!("hitl references unknown service '{}'", id));
        }
    }

    let mut referenced: Vec<(String, &str)> = Vec::new();
    if hitl.has_approval_tools() {
        referenced.push(("hitl.default_destination".into(), &hitl.default_destination));
    }
    for (id, o) in &hitl.services {
        if let Some(d) = &o.destination {
            referenced.push((format!("hitl.services.{}", id), d));
        }
    }
    for (id, tools) in &hitl.tools {
        for (tool, o) in tools {
            if let Some(d) = &o.destination {
                referenced.push((format!("hitl.tools.{}.{}", id, tool), d));
            }
        }
    }
    for (field, destination) in referenced {
        if !config.destinations.contains_key(destination) {
            errors.push(format!("{}: unknown destination '{}'", field, destination));
        }
    }

    if config.audit.retention_days == 0 {
        errors.push("audit.retention_days must be > 0".to_string());
    }
    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        errors.push(format!(
            "logging.level must be one of {}, got '{}'",
            LOG_LEVELS.join("|"),
            config.logging.level
        ));
    }
    if config.server.transport == ServerTransport::Http && config.server.port == 0 {
        errors.push("server.port must be > 0 for the http transport".to_string());
    }

    errors
}
