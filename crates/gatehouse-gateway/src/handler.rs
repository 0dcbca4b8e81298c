//! MCP JSON-RPC method handling shared by the stdio and HTTP transports.

use std::sync::Arc;

use gatehouse_runtime::protocol::{
    self, JsonRpcError, Message, INVALID_PARAMS, INVALID_REQUEST, MCP_PROTOCOL_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR, SUPPORTED_PROTOCOL_VERSIONS,
};
use gatehouse_runtime::{ProxyDispatcher, ProxyRuntime, ToolCatalog};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Live status figures reported by `/health`
pub trait ProxyStatus: Send + Sync {
    fn upstream_count(&self) -> usize;
    fn pending_approvals(&self) -> usize;
}

impl ProxyStatus for ProxyRuntime {
    fn upstream_count(&self) -> usize {
        self.registry().len()
    }

    fn pending_approvals(&self) -> usize {
        ProxyRuntime::pending_approvals(self)
    }
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

/// Answers downstream MCP requests from the registry catalog and the dispatcher
pub struct McpHandler {
    info: ServerInfo,
    catalog: Arc<dyn ToolCatalog>,
    dispatcher: Arc<ProxyDispatcher>,
}

impl McpHandler {
    pub fn new(info: ServerInfo, catalog: Arc<dyn ToolCatalog>, dispatcher: Arc<ProxyDispatcher>) -> Self {
        Self {
            info,
            catalog,
            dispatcher,
        }
    }

    pub fn from_runtime(runtime: &ProxyRuntime) -> Self {
        let server = &runtime.config().server;
        Self::new(
            ServerInfo {
                name: server.name.clone(),
                version: server.version.clone(),
            },
            runtime.catalog(),
            runtime.dispatcher(),
        )
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Handle one raw message. `None` means nothing should be sent back.
    pub async fn handle_text(&self, text: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.handle_value(value).await,
            Err(e) => {
                debug!(error = %e, "Unparsable message");
                Some(protocol::failure(
                    &Value::Null,
                    JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e)),
                ))
            }
        }
    }

    pub async fn handle_value(&self, value: Value) -> Option<Value> {
        let fallback_id = value.get("id").cloned().unwrap_or(Value::Null);
        match Message::classify(value) {
            Some(Message::Request { id, method, params }) => {
                let reply = match self.handle_request(&method, params).await {
                    Ok(result) => protocol::success(&id, result),
                    Err(error) => protocol::failure(&id, error),
                };
                Some(reply)
            }
            Some(Message::Notification { method, .. }) => {
                debug!(method = %method, "Client notification");
                None
            }
            Some(Message::Response { id, .. }) => {
                debug!(id = %id, "Ignoring client response");
                None
            }
            None => Some(protocol::failure(
                &fallback_id,
                JsonRpcError::new(INVALID_REQUEST, "Invalid Request"),
            )),
        }
    }

    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(self.initialize(params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.catalog.exposed_tools() })),
            "tools/call" => {
                let params = params
                    .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Missing params"))?;
                let call: CallParams = serde_json::from_value(params).map_err(|e| {
                    JsonRpcError::new(INVALID_PARAMS, format!("Invalid params: {}", e))
                })?;
                let result = self
                    .dispatcher
                    .handle_call(&call.name, call.arguments.unwrap_or_default())
                    .await;
                serde_json::to_value(result).map_err(|e| {
                    warn!(error = %e, "Failed to encode tool result");
                    JsonRpcError::new(protocol::INTERNAL_ERROR, "Failed to encode result")
                })
            }
            other => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let version = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v,
            _ => MCP_PROTOCOL_VERSION,
        };
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": self.info.name, "version": self.info.version },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_runtime::test_support::FakeConnection;
    use gatehouse_runtime::{ToolAccessPolicy, ToolInvoker, UpstreamRegistry, UpstreamService};

    fn handler(conn: &Arc<FakeConnection>) -> McpHandler {
        let registry = Arc::new(UpstreamRegistry::from_services(vec![UpstreamService::new(
            "github",
            ToolAccessPolicy::block(["delete_repo"]),
            conn.clone(),
            conn.tools(),
        )]));
        let invoker: Arc<dyn ToolInvoker> = registry.clone();
        McpHandler::new(
            ServerInfo {
                name: "gatehouse".into(),
                version: "1.2.3".into(),
            },
            registry,
            Arc::new(ProxyDispatcher::new(invoker, None, None)),
        )
    }

    fn request(id: i64, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    #[tokio::test]
    async fn test_initialize_advertises_list_changed() {
        let conn = FakeConnection::with_tools(&["list_repos"]);
        let reply = handler(&conn)
            .handle_value(request(1, "initialize", json!({"protocolVersion": "2024-11-05"})))
            .await
            .unwrap();
        let result = &reply["result"];
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["serverInfo"]["version"], "1.2.3");

        let reply = handler(&conn)
            .handle_value(request(2, "initialize", json!({"protocolVersion": "1999-01-01"})))
            .await
            .unwrap();
        assert_eq!(reply["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_tools_list_hides_blocked_tools() {
        let conn = FakeConnection::with_tools(&["list_repos", "delete_repo"]);
        let reply = handler(&conn)
            .handle_value(request(3, "tools/list", json!({})))
            .await
            .unwrap();
        let names: Vec<&str> = reply["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names, vec!["github__list_repos"]);
    }

    #[tokio::test]
    async fn test_tools_call_routes_and_reports_errors_in_result() {
        let conn = FakeConnection::with_tools(&["list_repos", "delete_repo"]);
        let h = handler(&conn);

        let ok = h
            .handle_value(request(
                4,
                "tools/call",
                json!({"name": "github__list_repos", "arguments": {"org": "acme"}}),
            ))
            .await
            .unwrap();
        assert_eq!(ok["result"]["content"][0]["text"], "list_repos done");
        assert_eq!(conn.calls()[0].1["org"], "acme");

        let blocked = h
            .handle_value(request(5, "tools/call", json!({"name": "github__delete_repo"})))
            .await
            .unwrap();
        assert_eq!(blocked["result"]["isError"], true);
        assert_eq!(conn.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let conn = FakeConnection::with_tools(&[]);
        let h = handler(&conn);

        let unknown = h.handle_value(request(6, "resources/list", json!({}))).await.unwrap();
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(unknown["id"], 6);

        let missing = h
            .handle_value(json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call"}))
            .await
            .unwrap();
        assert_eq!(missing["error"]["code"], INVALID_PARAMS);

        let invalid = h.handle_value(json!({"id": 8, "method": "ping"})).await.unwrap();
        assert_eq!(invalid["error"]["code"], INVALID_REQUEST);
        assert_eq!(invalid["id"], 8);

        let garbage = h.handle_text("{\"jsonrpc\":").await.unwrap();
        assert_eq!(garbage["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let conn = FakeConnection::with_tools(&[]);
        let h = handler(&conn);
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        assert!(h.handle_value(note).await.is_none());

        let pong = h.handle_value(request(9, "ping", Value::Null)).await.unwrap();
        assert_eq!(pong["result"], json!({}));
    }
}
