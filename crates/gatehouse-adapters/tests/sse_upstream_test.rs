//! Legacy HTTP+SSE upstreams against an in-process axum server.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use gatehouse_adapters::McpConnector;
use gatehouse_runtime::config::{UpstreamConfig, UpstreamTransport};
use gatehouse_runtime::{Connector, UpstreamConnection};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
struct FakeSseServer {
    stream: Arc<Mutex<Option<mpsc::UnboundedSender<Event>>>>,
    posted: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Option<String>>>,
}

impl FakeSseServer {
    fn push(&self, message: Value) {
        if let Some(tx) = self.stream.lock().unwrap().as_ref() {
            let _ = tx.send(Event::default().event("message").data(message.to_string()));
        }
    }

    fn posted(&self) -> Vec<Value> {
        self.posted.lock().unwrap().clone()
    }
}

async fn open_stream(
    State(server): State<FakeSseServer>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    *server.auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(Event::default().event("endpoint").data("/messages?sessionId=abc"));
    *server.stream.lock().unwrap() = Some(tx);
    Sse::new(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    }))
}

async fn silent_stream() -> Sse<futures::stream::Pending<Result<Event, Infallible>>> {
    Sse::new(futures::stream::pending())
}

async fn post_message(
    State(server): State<FakeSseServer>,
    Query(query): Query<HashMap<String, String>>,
    Json(message): Json<Value>,
) -> StatusCode {
    if query.get("sessionId").map(String::as_str) != Some("abc") {
        return StatusCode::BAD_REQUEST;
    }
    server.posted.lock().unwrap().push(message.clone());

    let result = match message["method"].as_str() {
        Some("initialize") => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "wiki", "version": "1"}
        }),
        Some("notifications/initialized") => {
            server.push(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}));
            return StatusCode::ACCEPTED;
        }
        Some("tools/list") => json!({
            "tools": [{"name": "lookup", "description": "Look up a page", "inputSchema": {"type": "object"}}]
        }),
        Some("tools/call") => json!({
            "content": [{
                "type": "text",
                "text": format!("{} {}", message["params"]["name"].as_str().unwrap_or(""), message["params"]["arguments"]["page"])
            }]
        }),
        _ => return StatusCode::ACCEPTED,
    };
    server.push(json!({"jsonrpc": "2.0", "id": message["id"], "result": result}));
    StatusCode::ACCEPTED
}

async fn start_server() -> (SocketAddr, FakeSseServer) {
    let server = FakeSseServer::default();
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/silent", get(silent_stream))
        .route("/messages", post(post_message))
        .with_state(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

fn upstream(addr: SocketAddr, path: &str) -> UpstreamConfig {
    serde_json::from_value(json!({
        "url": format!("http://{}{}", addr, path),
        "headers": {"Authorization": "Bearer wiki-token"}
    }))
    .unwrap()
}

fn args(page: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("page".into(), json!(page));
    map
}

#[tokio::test]
async fn test_bare_url_connects_over_sse_and_forwards_calls() {
    let (addr, server) = start_server().await;
    let config = upstream(addr, "/sse");
    assert_eq!(config.effective_transport(), Some(UpstreamTransport::Sse));

    let conn = McpConnector::new().connect("wiki", &config).await.unwrap();
    assert_eq!(
        server.auth.lock().unwrap().as_deref(),
        Some("Bearer wiki-token")
    );

    let tools = conn.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "lookup");
    assert_eq!(tools[0].input_schema, json!({"type": "object"}));

    let (home, faq) = tokio::join!(
        conn.call_tool("lookup", args("home")),
        conn.call_tool("lookup", args("faq"))
    );
    assert_eq!(home.unwrap()["content"][0]["text"], "lookup \"home\"");
    assert_eq!(faq.unwrap()["content"][0]["text"], "lookup \"faq\"");

    // The server's ping is answered through the message endpoint
    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.posted().iter().any(|m| m["id"] == "srv-1") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let pong = server
        .posted()
        .into_iter()
        .find(|m| m["id"] == "srv-1")
        .unwrap();
    assert_eq!(pong["result"], json!({}));

    conn.close().await.unwrap();
    assert!(conn.call_tool("lookup", args("home")).await.is_err());
}

#[tokio::test]
async fn test_missing_endpoint_event_times_out() {
    let (addr, _server) = start_server().await;
    let err = McpConnector::new()
        .with_timeout(Duration::from_millis(300))
        .connect("wiki", &upstream(addr, "/silent"))
        .await
        .err()
        .expect("no endpoint announced");
    assert!(err.to_string().contains("timed out"), "{:#}", err);
}

#[tokio::test]
async fn test_unreachable_stream_fails_connect() {
    let (addr, _server) = start_server().await;
    let err = McpConnector::new()
        .connect("wiki", &upstream(addr, "/missing"))
        .await
        .err()
        .expect("404 on the event stream");
    assert!(err.to_string().contains("404"), "{:#}", err);
}
