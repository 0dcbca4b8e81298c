use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::naming;
use crate::tool::{ToolCatalog, ToolDescriptor, ToolInvoker};
use crate::tool_policy::ToolAccessPolicy;

/// An established connection to one upstream tool provider
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Fetch the full tool catalog
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Run one tool, returning the raw `tools/call` result
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Value>;

    async fn close(&self) -> Result<()>;
}

/// Opens connections from service configuration
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        service_id: &str,
        config: &UpstreamConfig,
    ) -> Result<Arc<dyn UpstreamConnection>>;
}

/// One configured upstream service
pub struct UpstreamService {
    pub id: String,
    pub policy: ToolAccessPolicy,
    connection: Arc<dyn UpstreamConnection>,
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl UpstreamService {
    pub fn new(
        id: &str,
        policy: ToolAccessPolicy,
        connection: Arc<dyn UpstreamConnection>,
        tools: Vec<ToolDescriptor>,
    ) -> Self {
        Self {
            id: id.to_string(),
            policy,
            connection,
            tools: RwLock::new(tools),
        }
    }

    /// Snapshot of the cached catalog
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools().into_iter().map(|t| t.name).collect()
    }

    fn replace_tools(&self, tools: Vec<ToolDescriptor>) {
        match self.tools.write() {
            Ok(mut guard) => *guard = tools,
            Err(e) => *e.into_inner() = tools,
        }
    }
}

/// Owns one connection per configured service plus its cached catalog.
///
/// Membership is fixed at construction; only catalogs change afterwards.
pub struct UpstreamRegistry {
    services: BTreeMap<String, Arc<UpstreamService>>,
    closed: AtomicBool,
}

impl UpstreamRegistry {
    /// Connect every configured service and fetch its catalog.
    /// Any failure aborts startup; connections opened so far are closed.
    pub async fn connect_all(config: &ProxyConfig, connector: &dyn Connector) -> Result<Self> {
        info!(count = config.mcps.len(), "Connecting to upstream services");

        let mut services = Vec::with_capacity(config.mcps.len());
        for (id, upstream) in &config.mcps {
            match Self::connect_one(id, upstream, connector).await {
                Ok(service) => services.push(service),
                Err(e) => {
                    for opened in &services {
                        close_quietly(opened).await;
                    }
                    return Err(e.context(format!("Failed to connect to upstream service '{}'", id)));
                }
            }
        }

        Ok(Self::from_services(services))
    }

    async fn connect_one(
        id: &str,
        config: &UpstreamConfig,
        connector: &dyn Connector,
    ) -> Result<UpstreamService> {
        let connection = connector.connect(id, config).await?;
        let tools = match connection.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e.context("Failed to list tools"));
            }
        };
        info!(service = id, tool_count = tools.len(), "Discovered upstream tools");
        Ok(UpstreamService::new(id, config.tools.clone(), connection, tools))
    }

    /// Build a registry from already-connected services
    pub fn from_services(services: Vec<UpstreamService>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.id.clone(), Arc::new(s)))
                .collect(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<UpstreamService>> {
        self.services.get(service_id).cloned()
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<UpstreamService>> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Re-fetch a service catalog and cache it
    pub async fn refresh_tools(&self, service_id: &str) -> Result<Vec<ToolDescriptor>> {
        let service = self
            .get(service_id)
            .ok_or_else(|| anyhow!(ProxyError::UnknownUpstream(service_id.to_string())))?;
        let tools = service
            .connection
            .list_tools()
            .await
            .with_context(|| format!("Failed to refresh tools for '{}'", service_id))?;
        service.replace_tools(tools.clone());
        debug!(service = service_id, tool_count = tools.len(), "Tool catalog refreshed");
        Ok(tools)
    }

    /// Close every connection. Individual close errors are logged, not returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for service in self.services.values() {
            close_quietly(service).await;
        }
    }
}

async fn close_quietly(service: &UpstreamService) {
    match service.connection.close().await {
        Ok(()) => info!(service = %service.id, "Disconnected from upstream"),
        Err(e) => warn!(service = %service.id, error = %e, "Error disconnecting from upstream"),
    }
}

impl ToolCatalog for UpstreamRegistry {
    /// Policy-allowed tools of every service, renamed `<service>__<tool>` and
    /// described `[<service>] <description>`
    fn exposed_tools(&self) -> Vec<ToolDescriptor> {
        let mut exposed = Vec::new();
        for service in self.services.values() {
            for tool in service.tools() {
                if !service.policy.evaluate(&tool.name).is_allowed() {
                    continue;
                }
                let description = format!(
                    "[{}] {}",
                    service.id,
                    tool.description.as_deref().unwrap_or(&tool.name)
                );
                exposed.push(ToolDescriptor {
                    name: naming::compose(&service.id, &tool.name),
                    description: Some(description),
                    ..tool
                });
            }
        }
        exposed
    }
}

#[async_trait]
impl ToolInvoker for UpstreamRegistry {
    fn access_policy(&self, service_id: &str) -> Option<ToolAccessPolicy> {
        self.services.get(service_id).map(|s| s.policy.clone())
    }

    async fn invoke(
        &self,
        service_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, ProxyError> {
        let service = self
            .get(service_id)
            .ok_or_else(|| ProxyError::UnknownUpstream(service_id.to_string()))?;

        debug!(service = service_id, tool = tool_name, "Calling upstream tool");
        service
            .connection
            .call_tool(tool_name, arguments)
            .await
            .map_err(|e| ProxyError::UpstreamCallFailed {
                service: service_id.to_string(),
                tool: tool_name.to_string(),
                message: format!("{:#}", e),
            })
    }
}
