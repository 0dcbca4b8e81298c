//! Legacy MCP HTTP+SSE transport: one long-lived GET event stream carries every
//! server message, client messages are POSTed to the endpoint the server
//! announces in its first `endpoint` event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use gatehouse_runtime::config::UpstreamConfig;
use gatehouse_runtime::protocol::{self, JsonRpcError, Message, METHOD_NOT_FOUND};
use gatehouse_runtime::{ToolDescriptor, UpstreamConnection};
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http_client::{build_headers, check_status, SseDecoder};
use crate::mcp;

type Pending = DashMap<u64, oneshot::Sender<Result<Value, JsonRpcError>>>;

/// State shared with the event-stream reader
struct Session {
    service_id: String,
    client: Client,
    headers: HeaderMap,
    endpoint: Mutex<Option<Url>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    fn endpoint(&self) -> Option<Url> {
        match self.endpoint.lock() {
            Ok(e) => e.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    async fn post(&self, message: &Value) -> Result<()> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| anyhow!("Upstream '{}' has not announced an endpoint", self.service_id))?;
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(message)
            .send()
            .await
            .with_context(|| format!("POST to '{}' failed", self.service_id))?;
        check_status(response).await?;
        Ok(())
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(JsonRpcError::new(
                    protocol::INTERNAL_ERROR,
                    "upstream event stream closed",
                )));
            }
        }
    }
}

/// MCP server reached over the legacy HTTP+SSE transport
pub struct SseConnection {
    session: Arc<Session>,
    reader: JoinHandle<()>,
}

impl SseConnection {
    /// Open the event stream, wait for the endpoint and complete the handshake
    pub async fn connect(
        service_id: &str,
        config: &UpstreamConfig,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .with_context(|| format!("Service '{}' has no url", service_id))?;
        let base = Url::parse(url).with_context(|| format!("Invalid url for '{}': {}", service_id, url))?;
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let headers = build_headers(&config.headers)?;

        let response = tokio::time::timeout(
            connect_timeout,
            client
                .get(base.clone())
                .headers(headers.clone())
                .header(ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| anyhow!("Event stream did not open within {}ms", connect_timeout.as_millis()))?
        .with_context(|| format!("Failed to open event stream for '{}'", service_id))?;
        let response = check_status(response).await?;

        let session = Arc::new(Session {
            service_id: service_id.to_string(),
            client,
            headers,
            endpoint: Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_events(
            response.bytes_stream(),
            base,
            session.clone(),
            endpoint_tx,
        ));
        let conn = Self { session, reader };

        let handshake = async {
            endpoint_rx
                .await
                .map_err(|_| anyhow!("Event stream closed before announcing an endpoint"))?;
            let init = conn.request("initialize", mcp::initialize_params()).await?;
            debug!(
                service = service_id,
                server = ?init.get("serverInfo"),
                "Upstream initialized"
            );
            conn.session
                .post(&protocol::notification("notifications/initialized", None))
                .await
        };
        match tokio::time::timeout(connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                conn.shutdown();
                return Err(e.context("MCP handshake failed"));
            }
            Err(_) => {
                conn.shutdown();
                bail!(
                    "MCP handshake timed out after {}ms",
                    connect_timeout.as_millis()
                );
            }
        }

        info!(service = service_id, url, "Connected to SSE upstream");
        Ok(conn)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let session = &self.session;
        if session.closed.load(Ordering::SeqCst) {
            bail!("Upstream '{}' connection is closed", session.service_id);
        }
        let id = session.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        session.pending.insert(id, tx);
        if session.closed.load(Ordering::SeqCst) {
            session.pending.remove(&id);
            bail!("Upstream '{}' connection is closed", session.service_id);
        }

        if let Err(e) = session
            .post(&protocol::request(&json!(id), method, params))
            .await
        {
            session.pending.remove(&id);
            return Err(e.context(format!("{} request failed", method)));
        }

        let response = rx
            .await
            .map_err(|_| anyhow!("Upstream '{}' dropped request {}", session.service_id, id))?;
        mcp::into_result(method, response)
    }

    /// Stop reading and fail every waiter. Idempotent.
    fn shutdown(&self) {
        if self.session.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        self.session.fail_pending();
    }
}

#[async_trait]
impl UpstreamConnection for SseConnection {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..mcp::MAX_TOOL_PAGES {
            let result = self
                .request("tools/list", mcp::list_tools_params(cursor.as_deref()))
                .await?;
            let (page, next) = mcp::parse_tools_page(result)?;
            tools.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        bail!("tools/list exceeded {} pages", mcp::MAX_TOOL_PAGES)
    }

    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Value> {
        self.request("tools/call", mcp::call_tool_params(name, arguments))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_events<S>(
    mut stream: S,
    base: Url,
    session: Arc<Session>,
    endpoint_tx: oneshot::Sender<()>,
) where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::default();

    'stream: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(service = %session.service_id, error = %e, "Event stream read error");
                break;
            }
        };
        let events = match decoder.push_events(&chunk) {
            Ok(events) => events,
            Err(e) => {
                warn!(service = %session.service_id, error = %e, "Dropping event stream");
                break;
            }
        };
        for event in events {
            match event.event.as_deref() {
                Some("endpoint") => match base.join(event.data.trim()) {
                    Ok(url) => {
                        debug!(service = %session.service_id, endpoint = %url, "Upstream endpoint announced");
                        match session.endpoint.lock() {
                            Ok(mut e) => *e = Some(url),
                            Err(e) => *e.into_inner() = Some(url),
                        }
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    Err(e) => {
                        warn!(service = %session.service_id, error = %e, "Invalid endpoint event");
                        break 'stream;
                    }
                },
                None | Some("message") => dispatch(&session, &event.data),
                Some(other) => debug!(service = %session.service_id, event = other, "Ignoring SSE event"),
            }
        }
    }

    if !session.closed.swap(true, Ordering::SeqCst) {
        warn!(service = %session.service_id, "Upstream event stream ended");
    }
    session.fail_pending();
}

fn dispatch(session: &Arc<Session>, data: &str) {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        debug!(service = %session.service_id, "Skipping non-JSON SSE event");
        return;
    };
    match Message::classify(value) {
        Some(Message::Response { id, result }) => {
            match id.as_u64().and_then(|id| session.pending.remove(&id)) {
                Some((_, tx)) => {
                    let _ = tx.send(result);
                }
                None => debug!(service = %session.service_id, id = %id, "Response for unknown request"),
            }
        }
        Some(Message::Request { id, method, .. }) => {
            let reply = if method == "ping" {
                protocol::success(&id, json!({}))
            } else {
                protocol::failure(
                    &id,
                    JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", method)),
                )
            };
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.post(&reply).await {
                    debug!(service = %session.service_id, error = %e, "Failed to answer upstream request");
                }
            });
        }
        Some(Message::Notification { method, .. }) => {
            debug!(service = %session.service_id, method = %method, "Upstream notification");
        }
        None => debug!(service = %session.service_id, "Ignoring non JSON-RPC message"),
    }
}
