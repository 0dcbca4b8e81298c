mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use cli::{AuditCommands, Cli, Commands};
use commands::audit::ListOptions;
use commands::discover::Report;
use gatehouse_adapters::McpConnector;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't need a loaded config
    match &cli.command {
        Commands::Init { path } => return commands::init::run_init(path),
        Commands::Validate { config } => return commands::validate::execute(config),
        _ => {}
    }

    let config = config::load_config(&cli.config)?;
    gatehouse_runtime::init_logging(&config.logging.level, config.logging.format);

    match cli.command {
        Commands::Init { .. } | Commands::Validate { .. } => {}
        Commands::Serve => {
            let result = commands::serve::execute(config).await;
            // A blocked stdin read would otherwise keep the runtime alive
            let code = match result {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    1
                }
            };
            std::process::exit(code);
        }
        Commands::Discover => {
            commands::discover::execute(&config, &McpConnector::new(), Report::Catalog).await?;
        }
        Commands::Diff => {
            commands::discover::execute(&config, &McpConnector::new(), Report::Diff).await?;
        }
        Commands::Audit { action } => match action {
            AuditCommands::List {
                tool,
                mcp,
                last,
                since,
                decision,
            } => {
                let opts = ListOptions {
                    tool,
                    mcp,
                    last,
                    since,
                    decision,
                };
                commands::audit::list(&config, &opts)?;
            }
            AuditCommands::Export { format, output } => {
                commands::audit::export(&config, format, output.as_ref())?;
            }
        },
    }

    Ok(())
}
