use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use gatehouse_runtime::config::{DestinationConfig, ProxyConfig, UpstreamConfig, UpstreamTransport};
use gatehouse_runtime::{Connector, NotificationDriver, UpstreamConnection};
use tracing::debug;

use crate::http_client::HttpConnection;
use crate::sse_client::SseConnection;
use crate::stdio_client::StdioConnection;
use crate::telegram::TelegramDriver;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens stdio, SSE or streamable HTTP MCP connections per the service transport
pub struct McpConnector {
    connect_timeout: Duration,
}

impl McpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for McpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn connect(
        &self,
        service_id: &str,
        config: &UpstreamConfig,
    ) -> Result<Arc<dyn UpstreamConnection>> {
        match config.effective_transport() {
            Some(UpstreamTransport::Stdio) => {
                debug!(service = service_id, "Opening stdio upstream");
                let conn = StdioConnection::spawn(service_id, config, self.connect_timeout).await?;
                Ok(Arc::new(conn))
            }
            Some(UpstreamTransport::Sse) => {
                debug!(service = service_id, "Opening SSE upstream");
                let conn = SseConnection::connect(service_id, config, self.connect_timeout).await?;
                Ok(Arc::new(conn))
            }
            Some(UpstreamTransport::StreamableHttp) => {
                debug!(service = service_id, "Opening streamable HTTP upstream");
                let conn = HttpConnection::connect(service_id, config, self.connect_timeout).await?;
                Ok(Arc::new(conn))
            }
            None => bail!("Service '{}' has neither command nor url", service_id),
        }
    }
}

/// One driver per configured destination, keyed by destination name
pub fn build_drivers(config: &ProxyConfig) -> Result<HashMap<String, Arc<dyn NotificationDriver>>> {
    let mut drivers: HashMap<String, Arc<dyn NotificationDriver>> = HashMap::new();
    for (name, destination) in &config.destinations {
        let driver: Arc<dyn NotificationDriver> = match destination {
            DestinationConfig::Telegram(telegram) => Arc::new(TelegramDriver::new(telegram)?),
        };
        drivers.insert(name.clone(), driver);
    }
    Ok(drivers)
}
