//! Runtime over real child-process upstreams speaking MCP on stdio.
#![cfg(unix)]

use std::collections::HashMap;

use gatehouse_adapters::McpConnector;
use gatehouse_runtime::{AuditQuery, ProxyConfig, ProxyRuntime, ToolCatalog};
use serde_json::{json, Map};

const NOTES_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"notes","version":"1"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read_note"},{"name":"wipe_notes"}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"note body"}]}}\n' "$id"
      ;;
  esac
done
"#;

fn config(db_path: &str) -> ProxyConfig {
    serde_json::from_value(json!({
        "audit": {"db_path": db_path},
        "mcps": {
            "notes": {
                "command": "sh",
                "args": ["-c", NOTES_SERVER],
                "tools": {"block": ["wipe_notes"]}
            }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_forward_and_block_through_child_process() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("audit.db");
    let runtime = ProxyRuntime::start(
        config(db_path.to_str().unwrap()),
        &McpConnector::new(),
        HashMap::new(),
    )
    .await
    .unwrap();

    let exposed: Vec<String> = runtime
        .catalog()
        .exposed_tools()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(exposed, vec!["notes__read_note"]);

    let dispatcher = runtime.dispatcher();
    let mut args = Map::new();
    args.insert("id".into(), json!(3));
    args.insert("_agent".into(), json!("writer-bot"));
    let result = dispatcher.handle_call("notes__read_note", args).await;
    assert!(!result.is_error());
    assert_eq!(result.text_content(), "note body");

    let blocked = dispatcher.handle_call("notes__wipe_notes", Map::new()).await;
    assert!(blocked.is_error());

    let rows = runtime
        .audit()
        .unwrap()
        .query(&AuditQuery::default())
        .unwrap();
    assert_eq!(rows.len(), 2);
    let decisions: Vec<&str> = rows.iter().map(|r| r.decision.as_str()).collect();
    assert!(decisions.contains(&"passthrough"));
    assert!(decisions.contains(&"blocked"));
    let pass = rows.iter().find(|r| r.decision == "passthrough").unwrap();
    assert_eq!(pass.agent.as_deref(), Some("writer-bot"));
    assert_eq!(pass.params.as_deref(), Some(r#"{"id":3}"#));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_upstream_fails_startup() {
    let config: ProxyConfig = serde_json::from_value(json!({
        "audit": {"enabled": false},
        "mcps": {"ghost": {"command": "/nonexistent/ghost-mcp"}}
    }))
    .unwrap();
    let err = ProxyRuntime::start(config, &McpConnector::new(), HashMap::new())
        .await
        .err()
        .expect("startup must fail");
    assert!(format!("{:#}", err).contains("ghost"));
}
