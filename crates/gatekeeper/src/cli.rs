use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(about = "Gatehouse - policy-enforcing MCP proxy with human approval", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file
    #[arg(long, global = true, default_value = "gatehouse.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter config file
    Init {
        /// Path for new config file
        #[arg(default_value = "gatehouse.toml")]
        path: PathBuf,
    },
    /// Run the proxy on the configured transport
    Serve,
    /// Check a config file and report every problem
    Validate {
        /// Config file to check
        config: PathBuf,
    },
    /// Connect every upstream and list its tools
    Discover,
    /// Compare upstream catalogs with the configured policies
    Diff,
    /// Query the audit log
    Audit {
        #[command(subcommand)]
        action: AuditCommands,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// List recent audit entries, newest first
    List {
        /// Filter by tool name
        #[arg(long)]
        tool: Option<String>,
        /// Filter by upstream service
        #[arg(long)]
        mcp: Option<String>,
        /// Number of entries to show
        #[arg(long, default_value = "20", value_parser = clap::value_parser!(u32).range(1..))]
        last: u32,
        /// Only entries newer than this, e.g. 30s, 30m, 1h, 7d
        #[arg(long)]
        since: Option<String>,
        /// Filter by decision (approved, rejected, timeout, passthrough, blocked, error)
        #[arg(long)]
        decision: Option<String>,
    },
    /// Export every audit entry
    Export {
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum ExportFormat {
    Csv,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_list_defaults() {
        let cli = Cli::parse_from(["gatekeeper", "audit", "list", "--mcp", "github"]);
        assert_eq!(cli.config, PathBuf::from("gatehouse.toml"));
        match cli.command {
            Commands::Audit {
                action: AuditCommands::List { last, mcp, .. },
            } => {
                assert_eq!(last, 20);
                assert_eq!(mcp.as_deref(), Some("github"));
            }
            _ => panic!("expected audit list"),
        }
    }

    #[test]
    fn test_last_must_be_positive() {
        assert!(Cli::try_parse_from(["gatekeeper", "audit", "list", "--last", "0"]).is_err());
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["gatekeeper", "serve", "--config", "/etc/gh.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/gh.toml"));
    }
}
