use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProxyError;
use crate::tool_policy::ToolAccessPolicy;

/// Tool entry of an upstream catalog. `input_schema` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "default_input_schema")]
    pub input_schema: Value,
    /// Any other fields the upstream sent (annotations, title, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: default_input_schema(),
            extra: Map::new(),
        }
    }
}

/// Tool-call result returned to the agent: `{ content: [...], isError? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<Value>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text.into() })],
            is_error: None,
            extra: Map::new(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            ..Self::text(text)
        }
    }

    /// Wrap an upstream `tools/call` result. Results carrying a `content`
    /// array are forwarded as-is, anything else is serialized into one text block.
    pub fn from_upstream(result: Value) -> Self {
        if result.get("content").map(Value::is_array).unwrap_or(false) {
            if let Ok(parsed) = serde_json::from_value::<CallToolResult>(result.clone()) {
                return parsed;
            }
        }
        Self::text(result.to_string())
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Concatenated text of all text blocks
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<ProxyError> for CallToolResult {
    fn from(err: ProxyError) -> Self {
        CallToolResult::error(err.to_string())
    }
}

/// Narrow view of the upstream registry used by the dispatcher
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Access policy of a service, `None` when the service is unknown
    fn access_policy(&self, service_id: &str) -> Option<ToolAccessPolicy>;

    /// Forward a call upstream. Does not apply access policy.
    async fn invoke(
        &self,
        service_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ProxyError>;
}

/// Source of the externally visible (prefixed, filtered) tool listing
pub trait ToolCatalog: Send + Sync {
    fn exposed_tools(&self) -> Vec<ToolDescriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_result_shape() {
        let value = serde_json::to_value(CallToolResult::error("nope")).unwrap();
        assert_eq!(
            value,
            json!({"content": [{"type": "text", "text": "nope"}], "isError": true})
        );
    }

    #[test]
    fn test_success_result_omits_is_error() {
        let value = serde_json::to_value(CallToolResult::text("ok")).unwrap();
        assert!(value.get("isError").is_none());
    }

    #[test]
    fn test_from_upstream_keeps_content_verbatim() {
        let upstream = json!({
            "content": [{"type": "image", "data": "AAAA", "mimeType": "image/png"}],
            "structuredContent": {"n": 1}
        });
        let result = CallToolResult::from_upstream(upstream.clone());
        assert_eq!(serde_json::to_value(&result).unwrap(), upstream);
    }

    #[test]
    fn test_from_upstream_without_content_is_stringified() {
        let result = CallToolResult::from_upstream(json!({"rows": 3}));
        assert_eq!(result.text_content(), r#"{"rows":3}"#);
        assert!(!result.is_error());
    }

    #[test]
    fn test_descriptor_passes_schema_and_extras() {
        let raw = json!({
            "name": "search",
            "description": "Search issues",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}},
            "annotations": {"readOnlyHint": true}
        });
        let tool: ToolDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(tool.extra["annotations"]["readOnlyHint"], true);
        assert_eq!(serde_json::to_value(&tool).unwrap(), raw);
    }
}
