use anyhow::Result;
use gatehouse_adapters::{build_drivers, McpConnector};
use gatehouse_gateway::{serve_stdio, start_server, AppState, AuthConfig, McpHandler};
use gatehouse_runtime::config::ServerTransport;
use gatehouse_runtime::{ProxyConfig, ProxyRuntime};
use std::sync::Arc;
use tracing::{error, info};

pub async fn execute(config: ProxyConfig) -> Result<()> {
    let transport = config.server.transport;
    let drivers = build_drivers(&config)?;
    let runtime = Arc::new(ProxyRuntime::start(config, &McpConnector::new(), drivers).await?);
    let handler = Arc::new(McpHandler::from_runtime(&runtime));

    let served = match transport {
        ServerTransport::Stdio => {
            serve_stdio(
                handler,
                tokio::io::stdin(),
                tokio::io::stdout(),
                Some(runtime.discovery().subscribe()),
                shutdown_signal(),
            )
            .await
        }
        ServerTransport::Http => {
            let server = &runtime.config().server;
            let state = AppState {
                handler,
                status: runtime.clone(),
                auth_config: Arc::new(AuthConfig::new(server.auth_token.clone())),
            };
            start_server(state, &server.host, server.port, shutdown_signal()).await
        }
    };

    if let Err(e) = &served {
        error!(error = %format!("{:#}", e), "Transport failed");
    }
    runtime.shutdown().await;
    info!("Gatehouse stopped");
    served
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
