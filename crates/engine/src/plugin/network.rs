//! Dependencies that are already running somewhere reachable

use async_trait::async_trait;
use clnrm_common::{
    Error, HealthStatus, LifecycleState, ResourceUsage, Result, ServiceInstance, ServiceSpec,
};
use std::time::Duration;
use tokio::process::Command;

use super::{tcp_probe, ServicePlugin, NETWORK_SERVICE};

/// An external `host:port` endpoint; nothing is created or removed
#[derive(Debug, Clone)]
pub struct NetworkServicePlugin {
    connect_timeout: Duration,
}

impl NetworkServicePlugin {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for NetworkServicePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServicePlugin for NetworkServicePlugin {
    fn name(&self) -> &str {
        NETWORK_SERVICE
    }

    fn validate(&self, spec: &ServiceSpec) -> Result<()> {
        if spec.ports.is_empty() {
            return Err(Error::validation(
                format!("services.{}.ports", spec.name),
                "network_service needs a port to probe",
            ));
        }
        Ok(())
    }

    async fn start(&self, spec: &ServiceSpec) -> Result<ServiceInstance> {
        let mut instance = ServiceInstance::new(&spec.name, &spec.plugin, spec.reuse_key());
        if let Some(host) = spec.environment.get("HOST") {
            instance.host = host.clone();
        }
        instance.ports = spec.ports.iter().map(|p| (*p, *p)).collect();
        instance.state = LifecycleState::Starting;
        Ok(instance)
    }

    async fn stop(&self, _instance: &ServiceInstance) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self, instance: &ServiceInstance, _spec: &ServiceSpec) -> HealthStatus {
        match instance.ports.values().next() {
            Some(port) => tcp_probe(&instance.host, *port, self.connect_timeout).await,
            None => HealthStatus::Failed("no port to probe".to_string()),
        }
    }

    fn exec_command(
        &self,
        _instance: &ServiceInstance,
        _argv: &[String],
        _env: &[(String, String)],
    ) -> Option<Command> {
        None
    }

    fn estimate(&self, _spec: &ServiceSpec) -> ResourceUsage {
        ResourceUsage::default()
    }
}
