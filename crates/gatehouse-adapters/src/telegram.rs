//! Approval prompts over the Telegram Bot API with inline approve/reject buttons.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use gatehouse_runtime::config::TelegramDestination;
use gatehouse_runtime::{
    ApprovalDecision, ApprovalRequest, DecisionCallback, DecisionEvent, MessageUpdate,
    NotificationDriver,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const MAX_PARAMS_LEN: usize = 1500;
const LONG_POLL_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct User {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    #[serde(default)]
    chat: Option<Chat>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: User,
    #[serde(default)]
    message: Option<SentMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    callback_query: Option<CallbackQuery>,
}

/// Bot API client plus the state the polling loop needs
struct Bot {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
    callback: RwLock<Option<DecisionCallback>>,
    /// Sent prompts by message id, used to render the final edit
    requests: DashMap<String, ApprovalRequest>,
}

impl Bot {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}/bot{}/{}", self.api_base, self.token, method);
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            // The URL carries the bot token
            .map_err(|e| anyhow!("Telegram {} request failed: {}", method, e.without_url()))?;
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| anyhow!("Telegram {} returned malformed body: {}", method, e.without_url()))?;
        if !parsed.ok {
            bail!(
                "Telegram {} failed: {}",
                method,
                parsed.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        parsed
            .result
            .with_context(|| format!("Telegram {} returned no result", method))
    }

    fn decision_callback(&self) -> Option<DecisionCallback> {
        match self.callback.read() {
            Ok(cb) => cb.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    async fn poll_updates(self: Arc<Self>) {
        let mut offset: i64 = 0;
        loop {
            let body = json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["callback_query"],
            });
            let timeout = Duration::from_secs(LONG_POLL_SECS) + REQUEST_TIMEOUT;
            match self.call::<Vec<Update>>("getUpdates", &body, timeout).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(query) = update.callback_query {
                            self.handle_callback(query).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Telegram polling failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        let Some((decision, request_id)) = query.data.as_deref().and_then(parse_callback_data)
        else {
            debug!(data = ?query.data, "Ignoring unrelated callback");
            return;
        };

        if let (Ok(expected), Some(chat)) = (
            self.chat_id.parse::<i64>(),
            query.message.as_ref().and_then(|m| m.chat.as_ref()),
        ) {
            if chat.id != expected {
                warn!(chat_id = chat.id, "Ignoring callback from another chat");
                return;
            }
        }

        let decided_by = decider_name(&query.from);
        let ack_text = match decision {
            ApprovalDecision::Approved => "✅ Approved",
            _ => "❌ Rejected",
        };
        let ack = json!({ "callback_query_id": query.id, "text": ack_text });
        if let Err(e) = self.call::<Value>("answerCallbackQuery", &ack, REQUEST_TIMEOUT).await {
            warn!(error = %format!("{:#}", e), "Failed to acknowledge callback");
        }

        info!(request_id, decision = %decision, decided_by = %decided_by, "Approval response received");
        match self.decision_callback() {
            Some(callback) => callback(DecisionEvent {
                request_id: request_id.to_string(),
                decision,
                decided_by,
            }),
            None => warn!(request_id, "No decision handler registered"),
        }
    }
}

/// Telegram destination for approval prompts
pub struct TelegramDriver {
    bot: Arc<Bot>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramDriver {
    pub fn new(config: &TelegramDestination) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        let api_base = config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bot: Arc::new(Bot {
                client,
                api_base,
                token: config.bot_token.clone(),
                chat_id: config.chat_id.clone(),
                callback: RwLock::new(None),
                requests: DashMap::new(),
            }),
            poller: Mutex::new(None),
        })
    }
}

#[async_trait]
impl NotificationDriver for TelegramDriver {
    fn kind(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<()> {
        let me: User = self
            .bot
            .call("getMe", &json!({}), REQUEST_TIMEOUT)
            .await
            .context("Telegram bot token check failed")?;

        let task = tokio::spawn(self.bot.clone().poll_updates());
        let previous = match self.poller.lock() {
            Ok(mut p) => p.replace(task),
            Err(e) => e.into_inner().replace(task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(bot = ?me.username, "Telegram driver started");
        Ok(())
    }

    async fn send_request(&self, request: &ApprovalRequest) -> Result<String> {
        let body = json!({
            "chat_id": self.bot.chat_id,
            "text": render_request(request),
            "parse_mode": "HTML",
            "reply_markup": {
                "inline_keyboard": [[
                    {"text": "✅ Approve", "callback_data": format!("approve:{}", request.id)},
                    {"text": "❌ Reject", "callback_data": format!("reject:{}", request.id)},
                ]]
            },
        });
        let message: SentMessage = self
            .bot
            .call("sendMessage", &body, REQUEST_TIMEOUT)
            .await?;

        let message_ref = message.message_id.to_string();
        self.bot
            .requests
            .insert(message_ref.clone(), request.clone());
        info!(request_id = %request.id, message_id = %message_ref, "Approval request sent to Telegram");
        Ok(message_ref)
    }

    async fn update_message(&self, message_ref: &str, update: &MessageUpdate) -> Result<()> {
        let request = self.bot.requests.remove(message_ref).map(|(_, r)| r);
        let message_id: i64 = message_ref
            .parse()
            .with_context(|| format!("Invalid Telegram message id: {}", message_ref))?;
        let body = json!({
            "chat_id": self.bot.chat_id,
            "message_id": message_id,
            "text": render_result(request.as_ref(), update),
            "parse_mode": "HTML",
        });
        self.bot
            .call::<Value>("editMessageText", &body, REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    fn on_decision(&self, callback: DecisionCallback) {
        match self.bot.callback.write() {
            Ok(mut cb) => *cb = Some(callback),
            Err(e) => *e.into_inner() = Some(callback),
        }
    }

    async fn close(&self) -> Result<()> {
        let task = match self.poller.lock() {
            Ok(mut p) => p.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Telegram polling task failed");
                }
            }
        }
        self.bot.requests.clear();
        info!("Telegram driver stopped");
        Ok(())
    }
}

/// `approve:<id>` / `reject:<id>`
pub fn parse_callback_data(data: &str) -> Option<(ApprovalDecision, &str)> {
    let (action, request_id) = data.split_once(':')?;
    if request_id.is_empty() {
        return None;
    }
    match action {
        "approve" => Some((ApprovalDecision::Approved, request_id)),
        "reject" => Some((ApprovalDecision::Rejected, request_id)),
        _ => None,
    }
}

fn decider_name(user: &User) -> String {
    user.username
        .clone()
        .or_else(|| user.first_name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Pretty JSON, cut at 1500 characters, HTML-escaped
pub fn format_params(params: &Map<String, Value>) -> String {
    let pretty = serde_json::to_string_pretty(params).unwrap_or_else(|_| "{}".to_string());
    if pretty.chars().count() <= MAX_PARAMS_LEN {
        return escape_html(&pretty);
    }
    let cut: String = pretty.chars().take(MAX_PARAMS_LEN).collect();
    escape_html(&format!("{}\n...(truncated)", cut))
}

/// `M:SS` from one minute up, `Ns` below
pub fn format_countdown(timeout: Duration) -> String {
    let total = timeout.as_secs();
    let (min, sec) = (total / 60, total % 60);
    if min > 0 {
        format!("{}:{:02}", min, sec)
    } else {
        format!("{}s", sec)
    }
}

fn push_context(lines: &mut Vec<String>, request: &ApprovalRequest) {
    if let Some(agent) = &request.agent {
        lines.push(format!("<b>Agent:</b> {}", escape_html(agent)));
    }
    lines.push(format!("<b>MCP:</b> {}", escape_html(&request.service_id)));
    lines.push(format!("<b>Tool:</b> {}", escape_html(&request.tool_name)));
}

pub fn render_request(request: &ApprovalRequest) -> String {
    let mut lines = vec!["🔔 <b>Approval Request</b>".to_string(), String::new()];
    push_context(&mut lines, request);
    lines.push(String::new());
    if let Some(reason) = &request.reason {
        lines.push(format!("<b>Reason:</b> {}", escape_html(reason)));
    }
    if let Some(content) = &request.content {
        lines.push(format!("<b>Content:</b> {}", escape_html(content)));
    }
    lines.push(String::new());
    lines.push("<b>Parameters:</b>".to_string());
    lines.push(format!("<pre>{}</pre>", format_params(&request.arguments)));
    lines.push(String::new());
    lines.push(format!(
        "⏱ Auto-reject in {}",
        format_countdown(request.timeout)
    ));
    lines.join("\n")
}

pub fn render_result(request: Option<&ApprovalRequest>, update: &MessageUpdate) -> String {
    let (icon, label) = match update.decision {
        ApprovalDecision::Approved => ("✅", "Approved"),
        ApprovalDecision::Rejected => ("❌", "Rejected"),
        ApprovalDecision::Timeout => ("⏱", "Timed out"),
    };
    let headline = format!(
        "{} <b>{}</b> by {}",
        icon,
        label,
        escape_html(&update.decided_by)
    );
    let Some(request) = request else {
        return headline;
    };

    let mut lines = vec![headline, String::new()];
    push_context(&mut lines, request);
    if let Some(reason) = &request.reason {
        lines.push(format!("<b>Reason:</b> {}", escape_html(reason)));
    }
    lines.push(String::new());
    lines.push("<b>Parameters:</b>".to_string());
    lines.push(format!("<pre>{}</pre>", format_params(&request.arguments)));
    lines.push(String::new());
    lines.push(format!(
        "⏱ Response time: {:.1}s",
        update.elapsed.as_secs_f64()
    ));
    lines.join("\n")
}
