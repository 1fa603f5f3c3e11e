//! Service plugin registry
//!
//! A plugin knows how to bring one kind of dependency up, probe it and tear
//! it down. Definitions name plugins as strings; the registry resolves them
//! once, while the run is being validated, so an unknown plugin fails before
//! any container exists.

mod container;
mod network;

pub use container::{GenericContainerPlugin, OtelCollectorPlugin};
pub use network::NetworkServicePlugin;

use async_trait::async_trait;
use clnrm_common::{
    Error, HealthStatus, ResourceUsage, Result, ServiceInstance, ServiceSpec, TestDefinition,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::runtime::ContainerRuntime;

pub const GENERIC_CONTAINER: &str = "generic_container";
pub const OTEL_COLLECTOR: &str = "otel_collector";
pub const NETWORK_SERVICE: &str = "network_service";

/// Capability behind a plugin name
#[async_trait]
pub trait ServicePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Plugin-specific checks on a service spec, run during validation
    fn validate(&self, _spec: &ServiceSpec) -> Result<()> {
        Ok(())
    }

    /// Bring the service up; the returned instance is `Starting`
    async fn start(&self, spec: &ServiceSpec) -> Result<ServiceInstance>;

    async fn stop(&self, instance: &ServiceInstance) -> Result<()>;

    /// One health probe
    async fn health_check(&self, instance: &ServiceInstance, spec: &ServiceSpec) -> HealthStatus;

    /// Command running `argv` inside the service; None runs it on the host
    fn exec_command(
        &self,
        instance: &ServiceInstance,
        argv: &[String],
        env: &[(String, String)],
    ) -> Option<Command>;

    /// Live usage of a running instance, when the plugin can measure it
    async fn resource_usage(&self, _instance: &ServiceInstance) -> Option<ResourceUsage> {
        None
    }

    /// Static footprint estimate used before any history exists
    fn estimate(&self, spec: &ServiceSpec) -> ResourceUsage {
        estimate_by_type(spec.service_type.as_deref())
    }

    /// Variables every step of a run sees while this instance is up
    fn step_env(&self, _instance: &ServiceInstance) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Rough per-class footprint
pub fn estimate_by_type(service_type: Option<&str>) -> ResourceUsage {
    match service_type.unwrap_or("") {
        "database" | "db" => ResourceUsage::new(0.5, 512.0),
        "cache" => ResourceUsage::new(0.25, 128.0),
        "web_server" | "api" | "http" => ResourceUsage::new(0.5, 256.0),
        "message_queue" | "queue" => ResourceUsage::new(0.5, 384.0),
        "collector" | "observability" => ResourceUsage::new(0.25, 128.0),
        _ => ResourceUsage::new(0.25, 256.0),
    }
}

/// Name -> plugin map, populated before any run starts
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ServicePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins bound to a container runtime
    pub fn with_builtins(runtime: Arc<dyn ContainerRuntime>, host: &str) -> Self {
        let mut registry = Self::new();
        let generic = GenericContainerPlugin::new(runtime, host);
        registry.register(OTEL_COLLECTOR, Arc::new(OtelCollectorPlugin::new(generic.clone())));
        registry.register(GENERIC_CONTAINER, Arc::new(generic));
        registry.register(NETWORK_SERVICE, Arc::new(NetworkServicePlugin::new()));
        registry
    }

    /// Register a plugin under a name, replacing any previous binding
    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<dyn ServicePlugin>) {
        let name = name.into();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            debug!("Replaced plugin {}", name);
        }
        info!("Registered service plugin {}", name);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ServicePlugin>> {
        self.plugins.get(name).cloned().ok_or_else(|| Error::PluginNotFound {
            plugin: name.to_string(),
            service: String::new(),
        })
    }

    /// Resolve the plugin a service spec names
    pub fn resolve_for(&self, spec: &ServiceSpec) -> Result<Arc<dyn ServicePlugin>> {
        self.resolve(&spec.plugin).map_err(|_| Error::PluginNotFound {
            plugin: spec.plugin.clone(),
            service: spec.name.clone(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve every service's plugin and run its checks
    pub fn validate_definition(&self, definition: &TestDefinition) -> Result<()> {
        for spec in definition.services.values() {
            let plugin = self.resolve_for(spec)?;
            plugin.validate(spec)?;
        }
        Ok(())
    }

    /// Static footprint of a definition's services
    pub fn estimate_definition(&self, definition: &TestDefinition) -> ResourceUsage {
        let base = ResourceUsage::new(0.1, 64.0);
        definition.services.values().fold(base, |acc, spec| {
            let usage = match self.resolve_for(spec) {
                Ok(plugin) => plugin.estimate(spec),
                Err(_) => estimate_by_type(spec.service_type.as_deref()),
            };
            acc + usage
        })
    }
}

/// Connect to `host:port` within `timeout`
pub(crate) async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> HealthStatus {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => HealthStatus::Healthy,
        Ok(Err(e)) => HealthStatus::Failed(format!("connect {}: {}", addr, e)),
        Err(_) => HealthStatus::Failed(format!("connect {} timed out", addr)),
    }
}
