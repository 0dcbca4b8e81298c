//! JSON-RPC 2.0 envelopes shared by the MCP client transports and the gateway.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision spoken on both sides of the proxy
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Older revisions still accepted from downstream clients
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// Any inbound JSON-RPC message, classified by which members are present
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
        result: Result<Value, JsonRpcError>,
    },
}

impl Message {
    /// Classify a decoded JSON value. Returns `None` for values that are not
    /// JSON-RPC 2.0 messages.
    pub fn classify(value: Value) -> Option<Message> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return None;
        }
        let id = obj.remove("id").filter(|id| !id.is_null());
        let params = obj.remove("params");

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return Some(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        let id = id?;
        if let Some(error) = obj.remove("error") {
            let error = serde_json::from_value(error).ok()?;
            return Some(Message::Response {
                id,
                result: Err(error),
            });
        }
        let result = obj.remove("result")?;
        Some(Message::Response {
            id,
            result: Ok(result),
        })
    }
}

pub fn request(id: &Value, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params })
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "params": params }),
        None => json!({ "jsonrpc": JSONRPC_VERSION, "method": method }),
    }
}

pub fn success(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub fn failure(id: &Value, error: JsonRpcError) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error })
}
