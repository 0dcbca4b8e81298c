//! Client-side MCP payloads shared by the stdio and HTTP transports.

use anyhow::{anyhow, Context, Result};
use gatehouse_runtime::protocol::{JsonRpcError, MCP_PROTOCOL_VERSION};
use gatehouse_runtime::ToolDescriptor;
use serde_json::{json, Map, Value};

/// Upper bound on `tools/list` pages, guards against cursor loops
pub const MAX_TOOL_PAGES: usize = 100;

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "gatehouse",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

pub fn list_tools_params(cursor: Option<&str>) -> Value {
    match cursor {
        Some(cursor) => json!({ "cursor": cursor }),
        None => json!({}),
    }
}

pub fn call_tool_params(name: &str, arguments: Map<String, Value>) -> Value {
    json!({ "name": name, "arguments": arguments })
}

/// One page of a `tools/list` result plus the cursor for the next page
pub fn parse_tools_page(result: Value) -> Result<(Vec<ToolDescriptor>, Option<String>)> {
    let next = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| anyhow!("tools/list result missing 'tools'"))?;
    let tools: Vec<ToolDescriptor> =
        serde_json::from_value(tools).context("Malformed tools/list result")?;
    Ok((tools, next))
}

/// Turn a JSON-RPC response payload into a plain result
pub fn into_result(method: &str, response: Result<Value, JsonRpcError>) -> Result<Value> {
    response.map_err(|e| anyhow!("{} failed: {} (code {})", method, e.message, e.code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tools_page() {
        let (tools, next) = parse_tools_page(json!({
            "tools": [
                {"name": "search", "description": "Search", "inputSchema": {"type": "object"}},
                {"name": "bare"}
            ],
            "nextCursor": "abc"
        }))
        .unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1].input_schema, json!({"type": "object"}));
        assert_eq!(next.as_deref(), Some("abc"));

        let (_, last) = parse_tools_page(json!({"tools": [], "nextCursor": ""})).unwrap();
        assert_eq!(last, None);
        assert!(parse_tools_page(json!({})).is_err());
    }

    #[test]
    fn test_into_result_formats_rpc_errors() {
        let err = into_result(
            "tools/call",
            Err(JsonRpcError::new(-32602, "Unknown tool")),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "tools/call failed: Unknown tool (code -32602)");
    }
}
