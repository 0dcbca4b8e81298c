use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::types::ErrorResponse;

/// Bearer token required on the MCP endpoint
#[derive(Clone)]
pub struct AuthConfig {
    pub api_token: Option<String>,
}

impl AuthConfig {
    pub fn new(api_token: Option<String>) -> Self {
        Self {
            api_token: api_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_token.is_some()
    }

    /// Constant-time comparison of an `Authorization` header value
    pub fn accepts(&self, header: Option<&str>) -> bool {
        let Some(expected) = &self.api_token else {
            return true;
        };
        match header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) => token.as_bytes().ct_eq(expected.as_bytes()).into(),
            None => false,
        }
    }
}

pub async fn auth_middleware(
    auth_config: Arc<AuthConfig>,
    request: Request,
    next: Next,
) -> Response {
    // Health stays open for liveness checks
    if request.uri().path() == "/health" || !auth_config.is_enabled() {
        return next.run(request).await;
    }

    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if auth_config.accepts(header) {
        return next.run(request).await;
    }

    debug!(path = %request.uri().path(), "Rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Unauthorized".to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_matching_bearer_only() {
        let auth = AuthConfig::new(Some("s3cret".into()));
        assert!(auth.accepts(Some("Bearer s3cret")));
        assert!(!auth.accepts(Some("Bearer s3cre")));
        assert!(!auth.accepts(Some("Basic s3cret")));
        assert!(!auth.accepts(None));
    }

    #[test]
    fn test_empty_token_disables_auth() {
        let auth = AuthConfig::new(Some(String::new()));
        assert!(!auth.is_enabled());
        assert!(auth.accepts(None));
    }
}
