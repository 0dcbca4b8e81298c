use anyhow::{Context, Result};
use std::path::Path;

pub const STARTER_CONFIG: &str = r#"# Gatehouse configuration
# ${VAR} inside any string value is replaced from the environment.

[server]
# "stdio" (default) or "http"
transport = "stdio"
host = "127.0.0.1"
port = 8080
# auth_token = "${GATEHOUSE_TOKEN}"

[logging]
level = "info"
# "json" or "pretty"; logs go to stderr
format = "json"

[audit]
enabled = true
db_path = "./data/audit.db"
retention_days = 90

[hitl]
default_destination = "default"
default_timeout = "3m"

# Every tool listed here waits for a human decision before it runs.
[hitl.tools.github.create_pull_request]
timeout = "5m"

[destinations.default]
driver = "telegram"
bot_token = "${TELEGRAM_BOT_TOKEN}"
chat_id = "${TELEGRAM_CHAT_ID}"

# transport: "stdio" (inferred from command), "sse" (inferred from url)
# or "streamable-http"
[mcps.github]
command = "npx"
args = ["-y", "@modelcontextprotocol/server-github"]
env = { GITHUB_PERSONAL_ACCESS_TOKEN = "${GITHUB_TOKEN}" }
# "*" (default), { allow = [...] } or { block = [...] }
tools = { block = ["delete_repository"] }

[mcps.github.discovery]
enabled = false
poll_interval = "3h"
"#;

/// Write the starter config, never overwriting
pub fn run_init(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Config already exists at {}", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created config at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, validate};

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(STARTER_CONFIG).unwrap();
        assert!(validate(&config).is_empty(), "{:?}", validate(&config));
        assert!(config.hitl.requires_approval("github", "create_pull_request"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gatehouse.toml");
        run_init(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), STARTER_CONFIG);
        assert!(run_init(&path).is_err());
    }
}
