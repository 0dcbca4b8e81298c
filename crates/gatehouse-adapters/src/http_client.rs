use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use gatehouse_runtime::config::UpstreamConfig;
use gatehouse_runtime::protocol::{self, JsonRpcError, Message, MCP_PROTOCOL_VERSION};
use gatehouse_runtime::{ToolDescriptor, UpstreamConnection};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::mcp;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Max buffered SSE bytes before giving up on a response stream
const MAX_BUFFER_SIZE: usize = 4 * 1_048_576;

/// MCP server reached over streamable HTTP
pub struct HttpConnection {
    service_id: String,
    client: Client,
    url: String,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    initialized: AtomicBool,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpConnection {
    pub async fn connect(
        service_id: &str,
        config: &UpstreamConfig,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let url = config
            .url
            .clone()
            .with_context(|| format!("Service '{}' has no url", service_id))?;
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let conn = Self {
            service_id: service_id.to_string(),
            client,
            url,
            headers: build_headers(&config.headers)?,
            session_id: RwLock::new(None),
            initialized: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };

        let handshake = async {
            conn.request("initialize", mcp::initialize_params()).await?;
            conn.initialized.store(true, Ordering::SeqCst);
            conn.notify("notifications/initialized").await
        };
        tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                anyhow!(
                    "MCP handshake timed out after {}ms",
                    connect_timeout.as_millis()
                )
            })?
            .context("MCP handshake failed")?;

        info!(service = service_id, url = %conn.url, "Connected to HTTP upstream");
        Ok(conn)
    }

    fn session_id(&self) -> Option<String> {
        match self.session_id.read() {
            Ok(s) => s.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn post(&self, body: &Value) -> RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        if self.initialized.load(Ordering::SeqCst) {
            builder = builder.header(PROTOCOL_HEADER, MCP_PROTOCOL_VERSION);
        }
        builder
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("Upstream '{}' connection is closed", self.service_id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post(&protocol::request(&json!(id), method, params))
            .send()
            .await
            .with_context(|| format!("{} request to '{}' failed", method, self.service_id))?;
        let response = check_status(response).await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = match self.session_id.write() {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            if guard.as_deref() != Some(session) {
                debug!(service = %self.service_id, "Upstream session established");
                *guard = Some(session.to_string());
            }
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let payload = if is_sse {
            read_sse_response(response.bytes_stream(), id).await?
        } else {
            let body: Value = response
                .json()
                .await
                .context("Failed to parse JSON-RPC response")?;
            match Message::classify(body) {
                Some(Message::Response { result, .. }) => result,
                _ => bail!("Upstream returned a non JSON-RPC response to {}", method),
            }
        };
        mcp::into_result(method, payload)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let response = self
            .post(&protocol::notification(method, None))
            .send()
            .await
            .with_context(|| format!("{} notification failed", method))?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl UpstreamConnection for HttpConnection {
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

    /// Ends the server session with a best-effort DELETE
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        let delete = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match delete {
            Ok(resp) => debug!(service = %self.service_id, status = %resp.status(), "Session closed"),
            Err(e) => warn!(service = %self.service_id, error = %e, "Failed to close session"),
        }
        Ok(())
    }
}

pub(crate) fn build_headers(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("Invalid header name: {}", name))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for header {}", name))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("HTTP {}: {}", status, body.chars().take(500).collect::<String>())
}

/// Read SSE events until the response for `id` arrives
async fn read_sse_response<S>(mut stream: S, id: u64) -> Result<Result<Value, JsonRpcError>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    let mut decoder = SseDecoder::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("SSE read error")?;
        for data in decoder.push(&chunk)? {
            let Ok(value) = serde_json::from_str::<Value>(&data) else {
                debug!("Skipping non-JSON SSE event");
                continue;
            };
            match Message::classify(value) {
                Some(Message::Response { id: rid, result }) if rid.as_u64() == Some(id) => {
                    return Ok(result);
                }
                Some(other) => debug!(message = ?other, "Ignoring unrelated SSE message"),
                None => {}
            }
        }
    }
    bail!("SSE stream ended before response {} arrived", id)
}

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, `None` for the default `message` type
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser.
/// Buffers raw bytes so UTF-8 sequences split across chunks survive.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// The `data` payload of each complete event
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        Ok(self.push_events(bytes)?.into_iter().map(|e| e.data).collect())
    }

    /// Complete events with their type. Events without data are dropped.
    pub fn push_events(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUFFER_SIZE {
            bail!("SSE buffer exceeded {}B limit", MAX_BUFFER_SIZE);
        }

        let mut events = Vec::new();
        while let Some((pos, delim)) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + delim).take(pos).collect();
            let block = String::from_utf8_lossy(&block);
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(d) = line.strip_prefix("data:") {
                    data.push(d.strip_prefix(' ').unwrap_or(d));
                } else if let Some(e) = line.strip_prefix("event:") {
                    event = Some(e.trim().to_string());
                }
            }
            if !data.is_empty() {
                events.push(SseEvent {
                    event,
                    data: data.join("\n"),
                });
            }
        }
        Ok(events)
    }
}

/// Position and length of the first blank-line delimiter
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: message\ndata: {\"a\":").unwrap().is_empty());
        let events = decoder.push(b"1}\n\ndata: second\n\n").unwrap();
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_sse_decoder_multiline_and_crlf() {
        let mut decoder = SseDecoder::default();
        let events = decoder
            .push(b"data: line1\r\ndata:line2\r\n\r\n: comment\n\n")
            .unwrap();
        assert_eq!(events, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn test_sse_decoder_reports_event_type() {
        let mut decoder = SseDecoder::default();
        let events = decoder
            .push_events(b"event: endpoint\ndata: /messages?sessionId=1\n\ndata: {}\n\n")
            .unwrap();
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?sessionId=1");
        assert_eq!(events[1].event, None);
    }

    #[test]
    fn test_sse_decoder_keeps_utf8_across_chunks() {
        let mut decoder = SseDecoder::default();
        let text = "data: caf\u{e9}\n\n".as_bytes();
        let split = text.len() - 3;
        assert!(decoder.push(&text[..split]).unwrap().is_empty());
        assert_eq!(decoder.push(&text[split..]).unwrap(), vec!["caf\u{e9}".to_string()]);
    }

    #[tokio::test]
    async fn test_read_sse_picks_matching_id() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
            )),
            Ok(Bytes::from_static(
                b"data: {\"jsonrpc\":\"2.0\",\"id\":6,\"result\":{}}\n\n",
            )),
            Ok(Bytes::from_static(
                b"data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n\n",
            )),
        ];
        let result = read_sse_response(futures::stream::iter(chunks), 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_read_sse_without_response_errors() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from_static(b"data: {}\n\n"))];
        assert!(read_sse_response(futures::stream::iter(chunks), 1)
            .await
            .is_err());
    }

    #[test]
    fn test_build_headers_validates() {
        let mut ok = BTreeMap::new();
        ok.insert("Authorization".to_string(), "Bearer abc".to_string());
        assert_eq!(build_headers(&ok).unwrap().len(), 1);

        let mut bad = BTreeMap::new();
        bad.insert("bad header".to_string(), "x".to_string());
        assert!(build_headers(&bad).is_err());
    }
}
