use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use gatehouse_runtime::config::UpstreamConfig;
use gatehouse_runtime::protocol::{self, JsonRpcError, Message, METHOD_NOT_FOUND};
use gatehouse_runtime::{ToolDescriptor, UpstreamConnection};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::mcp;

type Pending = DashMap<u64, oneshot::Sender<Result<Value, JsonRpcError>>>;

/// Request/response plumbing shared with the reader task
struct Rpc {
    service_id: String,
    pending: Pending,
    outgoing: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Rpc {
    fn send_line(&self, message: &Value) -> Result<()> {
        self.outgoing
            .send(message.to_string())
            .map_err(|_| anyhow!("Upstream '{}' stdin is closed", self.service_id))
    }

    /// Fail every waiter; the child is gone
    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(JsonRpcError::new(
                    protocol::INTERNAL_ERROR,
                    "upstream process exited",
                )));
            }
        }
    }
}

/// MCP server running as a child process, newline-delimited JSON-RPC on stdio
pub struct StdioConnection {
    rpc: Arc<Rpc>,
    child: Mutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioConnection {
    /// Spawn the configured command and complete the MCP handshake
    pub async fn spawn(
        service_id: &str,
        config: &UpstreamConfig,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .with_context(|| format!("Service '{}' has no command", service_id))?;

        let mut child = Command::new(command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", command))?;

        debug!(service = service_id, command, pid = ?child.id(), "Upstream process spawned");

        let stdin = child.stdin.take().context("Failed to get child stdin")?;
        let stdout = child.stdout.take().context("Failed to get child stdout")?;
        let stderr = child.stderr.take().context("Failed to get child stderr")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(Rpc {
            service_id: service_id.to_string(),
            pending: DashMap::new(),
            outgoing: tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(write_loop(stdin, rx, service_id.to_string())),
            tokio::spawn(read_loop(stdout, rpc.clone())),
            tokio::spawn(forward_stderr(stderr, service_id.to_string())),
        ];

        let conn = Self {
            rpc,
            child: Mutex::new(Some(child)),
            tasks,
        };

        let handshake = async {
            let init = conn.request("initialize", mcp::initialize_params()).await?;
            debug!(
                service = service_id,
                server = ?init.get("serverInfo"),
                "Upstream initialized"
            );
            conn.rpc
                .send_line(&protocol::notification("notifications/initialized", None))
        };
        match tokio::time::timeout(connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                conn.shutdown().await;
                return Err(e.context("MCP handshake failed"));
            }
            Err(_) => {
                conn.shutdown().await;
                bail!(
                    "MCP handshake timed out after {}ms",
                    connect_timeout.as_millis()
                );
            }
        }

        info!(service = service_id, "Connected to stdio upstream");
        Ok(conn)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.rpc.closed.load(Ordering::SeqCst) {
            bail!("Upstream '{}' connection is closed", self.rpc.service_id);
        }
        let id = self.rpc.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.rpc.pending.insert(id, tx);
        // The reader may have drained the map between the check and the insert
        if self.rpc.closed.load(Ordering::SeqCst) {
            self.rpc.pending.remove(&id);
            bail!("Upstream '{}' connection is closed", self.rpc.service_id);
        }

        if let Err(e) = self.rpc.send_line(&protocol::request(&json!(id), method, params)) {
            self.rpc.pending.remove(&id);
            return Err(e);
        }

        let response = rx
            .await
            .map_err(|_| anyhow!("Upstream '{}' dropped request {}", self.rpc.service_id, id))?;
        mcp::into_result(method, response)
    }

    /// Kill the child and stop the I/O tasks. Idempotent.
    async fn shutdown(&self) {
        if self.rpc.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rpc.fail_pending();
        let child = match self.child.lock() {
            Ok(mut c) => c.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(service = %self.rpc.service_id, error = %e, "Kill failed, process already exited");
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl UpstreamConnection for StdioConnection {
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
        self.shutdown().await;
        Ok(())
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        let child = match self.child.lock() {
            Ok(mut c) => c.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                warn!(error = ?e, "Failed to kill upstream process");
            }
        }
    }
}

async fn write_loop(stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>, service_id: String) {
    let mut sink = FramedWrite::new(stdin, LinesCodec::new());
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            warn!(service = %service_id, error = %e, "Failed to write to upstream stdin");
            return;
        }
    }
}

async fn read_loop(stdout: ChildStdout, rpc: Arc<Rpc>) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(service = %rpc.service_id, error = %e, "Upstream stdout read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            debug!(service = %rpc.service_id, line = %line, "Ignoring non-JSON upstream output");
            continue;
        };

        match Message::classify(value) {
            Some(Message::Response { id, result }) => {
                let waiter = id.as_u64().and_then(|id| rpc.pending.remove(&id));
                match waiter {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => debug!(service = %rpc.service_id, id = %id, "Response for unknown request"),
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
                let _ = rpc.send_line(&reply);
            }
            Some(Message::Notification { method, .. }) => {
                debug!(service = %rpc.service_id, method = %method, "Upstream notification");
            }
            None => debug!(service = %rpc.service_id, "Ignoring non JSON-RPC message"),
        }
    }

    if !rpc.closed.swap(true, Ordering::SeqCst) {
        warn!(service = %rpc.service_id, "Upstream process closed its output");
    }
    rpc.fail_pending();
}

async fn forward_stderr(stderr: ChildStderr, service_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(service = %service_id, stderr = %line, "Upstream stderr");
    }
}
