//! Newline-delimited JSON-RPC over a byte stream (stdin/stdout in production).

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use gatehouse_runtime::protocol;
use gatehouse_runtime::CatalogChange;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::handler::McpHandler;

pub const LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Serve MCP until the input reaches EOF or `shutdown` completes.
///
/// Each request runs on its own task so a call parked on an approval does
/// not block the rest of the session. A single writer task owns the output.
pub async fn serve_stdio<R, W, F>(
    handler: Arc<McpHandler>,
    input: R,
    output: W,
    changes: Option<broadcast::Receiver<CatalogChange>>,
    shutdown: F,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(output, LinesCodec::new());
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message.to_string()).await {
                warn!(error = %e, "Failed to write to client");
                break;
            }
        }
    });

    let notifier = changes.map(|mut changes| {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        debug!(service_id = %change.service_id, "Announcing tool list change");
                        if tx.send(protocol::notification(LIST_CHANGED, None)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Catalog change events lagged");
                        if tx.send(protocol::notification(LIST_CHANGED, None)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let mut lines = FramedRead::new(input, LinesCodec::new());
    tokio::pin!(shutdown);

    info!("Serving MCP on stdio");
    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                info!("Stdio transport stopping");
                break;
            }
            line = lines.next() => line,
        };
        match line {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle_text(&line).await {
                        let _ = tx.send(reply);
                    }
                });
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read from client");
                break;
            }
            None => {
                info!("Client closed stdin");
                break;
            }
        }
    }

    if let Some(notifier) = notifier {
        notifier.abort();
    }
    // Requests still running keep their own sender and flush when they finish
    drop(tx);
    drop(writer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_runtime::test_support::FakeConnection;
    use gatehouse_runtime::{
        ProxyDispatcher, ToolAccessPolicy, ToolCatalog, ToolInvoker, UpstreamRegistry,
        UpstreamService,
    };
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::handler::ServerInfo;

    fn handler() -> Arc<McpHandler> {
        let conn = FakeConnection::with_tools(&["search"]);
        let registry = Arc::new(UpstreamRegistry::from_services(vec![UpstreamService::new(
            "docs",
            ToolAccessPolicy::default(),
            conn.clone(),
            conn.tools(),
        )]));
        let invoker: Arc<dyn ToolInvoker> = registry.clone();
        let catalog: Arc<dyn ToolCatalog> = registry;
        let dispatcher = Arc::new(ProxyDispatcher::new(invoker, None, None));
        Arc::new(McpHandler::new(
            ServerInfo {
                name: "gatehouse".into(),
                version: "0.1.0".into(),
            },
            catalog,
            dispatcher,
        ))
    }

    #[tokio::test]
    async fn test_requests_answered_and_eof_ends_session() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(serve_stdio(
            handler(),
            server_read,
            server_write,
            None,
            std::future::pending(),
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        client_write
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();

        let mut reader = BufReader::new(client_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["tools"][0]["name"], "docs__search");

        client_write.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_catalog_change_emits_list_changed() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (events, rx) = broadcast::channel(4);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(serve_stdio(
            handler(),
            server_read,
            server_write,
            Some(rx),
            async move {
                let _ = stop_rx.await;
            },
        ));

        events
            .send(CatalogChange {
                service_id: "docs".into(),
                added: vec!["fetch".into()],
                ..Default::default()
            })
            .unwrap();

        let (client_read, _client_write) = tokio::io::split(client);
        let mut reader = BufReader::new(client_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let note: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(note["method"], LIST_CHANGED);
        assert!(note.get("id").is_none());

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_line_gets_parse_error() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(serve_stdio(
            handler(),
            server_read,
            server_write,
            None,
            std::future::pending(),
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"{not json\n").await.unwrap();
        let mut reader = BufReader::new(client_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let reply: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["error"]["code"], protocol::PARSE_ERROR);
        assert_eq!(reply["id"], Value::Null);

        client_write.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
