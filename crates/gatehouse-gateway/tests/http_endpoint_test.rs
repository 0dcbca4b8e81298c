//! HTTP transport: /health, /mcp JSON-RPC and bearer auth.


use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use gatehouse_gateway::create_router;
use test_helpers::{make_state, post_mcp, rpc, start_proxy};

#[tokio::test]
async fn test_health_reports_runtime_status() {
    let proxy = start_proxy().await;
    let state = make_state(&proxy, Some("secret-token"));

    // No token, but /health should still succeed
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = create_router(state).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let health: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], "9.9.9");
    assert_eq!(health["upstreams"], 2);
    assert_eq!(health["pending_approvals"], 0);

    proxy.runtime.shutdown().await;
}

#[tokio::test]
async fn test_mcp_requires_bearer_token() {
    let proxy = start_proxy().await;
    let state = make_state(&proxy, Some("secret-token"));
    let ping = rpc(1, "ping", json!({}));

    let (status, _) = post_mcp(&state, &ping, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_mcp(&state, &ping, Some("wrong-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = post_mcp(&state, &ping, Some("secret-token")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["result"], json!({}));

    proxy.runtime.shutdown().await;
}

#[tokio::test]
async fn test_tools_list_and_call_over_http() {
    let proxy = start_proxy().await;
    let state = make_state(&proxy, None);

    let (_, body) = post_mcp(&state, &rpc(1, "tools/list", json!({})), None).await;
    let body = body.unwrap();
    let mut names: Vec<String> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["github__list_repos", "jira__create_issue", "jira__search"]
    );

    let call = rpc(
        2,
        "tools/call",
        json!({"name": "github__list_repos", "arguments": {"_agent": "ci-bot", "org": "acme"}}),
    );
    let (status, body) = post_mcp(&state, &call, None).await;
    assert_eq!(status, StatusCode::OK);
    let body = body.unwrap();
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["content"][0]["text"], "list_repos done");

    let forwarded = proxy.github.calls();
    assert_eq!(forwarded.len(), 1);
    assert!(!forwarded[0].1.contains_key("_agent"));

    proxy.runtime.shutdown().await;
}

#[tokio::test]
async fn test_notification_is_accepted_without_body() {
    let proxy = start_proxy().await;
    let state = make_state(&proxy, None);

    let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    let (status, body) = post_mcp(&state, &note, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.is_none());

    proxy.runtime.shutdown().await;
}

#[tokio::test]
async fn test_unparsable_body_gets_parse_error() {
    let proxy = start_proxy().await;
    let state = make_state(&proxy, None);

    let req = Request::builder()
        .method("POST")
        .uri("/mcp")
        .body(Body::from("{oops"))
        .unwrap();
    let resp = create_router(state).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], -32700);

    proxy.runtime.shutdown().await;
}
