use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{auth_middleware, AuthConfig};
use crate::handler::{McpHandler, ProxyStatus};
use crate::types::{ErrorResponse, HealthResponse};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<McpHandler>,
    pub status: Arc<dyn ProxyStatus>,
    pub auth_config: Arc<AuthConfig>,
}

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    let auth_config = state.auth_config.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/mcp", post(mcp_endpoint))
        .layer(middleware::from_fn(move |req, next| {
            auth_middleware(auth_config.clone(), req, next)
        }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve HTTP until `shutdown` completes, then let open requests finish
pub async fn start_server<F>(state: AppState, host: &str, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = format!("{}:{}", host, port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Serving MCP over HTTP");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: state.handler.info().version.clone(),
        upstreams: state.status.upstream_count(),
        pending_approvals: state.status.pending_approvals(),
    })
}

async fn mcp_endpoint(State(state): State<AppState>, body: String) -> Response {
    // Detached: a client hanging up must not cancel a call parked on approval
    let handler = state.handler.clone();
    let call = tokio::spawn(async move { handler.handle_text(&body).await });
    match call.await {
        Ok(Some(reply)) => Json(reply).into_response(),
        // Notifications and client responses
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(error = %e, "MCP request task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Internal error".to_string(),
                }),
            )
                .into_response()
        }
    }
}
