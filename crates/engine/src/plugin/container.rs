//! Container-backed plugins

use async_trait::async_trait;
use clnrm_common::{
    Error, HealthStatus, LifecycleState, ResourceUsage, Result, ServiceInstance, ServiceSpec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{estimate_by_type, tcp_probe, ServicePlugin, GENERIC_CONTAINER, OTEL_COLLECTOR};
use crate::runtime::{short_id, ContainerRequest, ContainerRuntime};

/// Upper bound on a single health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Any image started through the container runtime
#[derive(Clone)]
pub struct GenericContainerPlugin {
    runtime: Arc<dyn ContainerRuntime>,
    host: String,
}

impl GenericContainerPlugin {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, host: &str) -> Self {
        Self {
            runtime,
            host: host.to_string(),
        }
    }

    async fn start_image(&self, spec: &ServiceSpec, image: &str, ports: &[u16]) -> Result<ServiceInstance> {
        let reuse_key = spec.reuse_key();
        let request = ContainerRequest {
            service: spec.name.clone(),
            image: image.to_string(),
            env: spec
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ports: ports.to_vec(),
            labels: vec![("clnrm.reuse_key".to_string(), reuse_key.0.clone())],
        };

        let handle = self.runtime.create(&request).await?;

        let mut instance = ServiceInstance::new(&spec.name, &spec.plugin, reuse_key);
        instance.container_id = Some(handle.id);
        instance.host = self.host.clone();
        instance.ports = handle.ports;
        instance.state = LifecycleState::Starting;
        Ok(instance)
    }

    /// Exec the declared health command; no declared command means running is healthy
    async fn exec_probe(&self, instance: &ServiceInstance, spec: &ServiceSpec) -> HealthStatus {
        let Some(check) = &spec.health_check else {
            return HealthStatus::Healthy;
        };
        let Some(container_id) = &instance.container_id else {
            return HealthStatus::Failed("instance has no container".to_string());
        };

        let mut cmd = self.runtime.exec_command(container_id, &check.command, &[]);
        cmd.kill_on_drop(true);
        let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return HealthStatus::Failed(format!("health command: {}", e)),
            Err(_) => return HealthStatus::Failed("health command timed out".to_string()),
        };

        if !output.status.success() {
            return HealthStatus::Failed(format!(
                "health command exited with {}",
                output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
            ));
        }

        match &check.pattern {
            Some(pattern) => {
                let text = String::from_utf8_lossy(&output.stdout);
                match regex::Regex::new(pattern) {
                    Ok(re) if re.is_match(&text) => HealthStatus::Healthy,
                    Ok(_) => HealthStatus::Degraded(format!("output did not match /{}/", pattern)),
                    Err(e) => HealthStatus::Failed(format!("invalid pattern: {}", e)),
                }
            }
            None => HealthStatus::Healthy,
        }
    }
}

#[async_trait]
impl ServicePlugin for GenericContainerPlugin {
    fn name(&self) -> &str {
        GENERIC_CONTAINER
    }

    fn validate(&self, spec: &ServiceSpec) -> Result<()> {
        match spec.image.as_deref() {
            Some(image) if !image.trim().is_empty() => Ok(()),
            _ => Err(Error::validation(
                format!("services.{}.image", spec.name),
                "generic_container requires an image",
            )),
        }
    }

    async fn start(&self, spec: &ServiceSpec) -> Result<ServiceInstance> {
        let image = spec.image.as_deref().ok_or_else(|| {
            Error::validation(format!("services.{}.image", spec.name), "missing image")
        })?;
        self.start_image(spec, image, &spec.ports).await
    }

    async fn stop(&self, instance: &ServiceInstance) -> Result<()> {
        if let Some(id) = &instance.container_id {
            debug!("Stopping {} ({})", instance.service, short_id(id));
            self.runtime.remove(id).await?;
        }
        Ok(())
    }

    async fn health_check(&self, instance: &ServiceInstance, spec: &ServiceSpec) -> HealthStatus {
        self.exec_probe(instance, spec).await
    }

    fn exec_command(
        &self,
        instance: &ServiceInstance,
        argv: &[String],
        env: &[(String, String)],
    ) -> Option<Command> {
        instance
            .container_id
            .as_ref()
            .map(|id| self.runtime.exec_command(id, argv, env))
    }

    async fn resource_usage(&self, instance: &ServiceInstance) -> Option<ResourceUsage> {
        match &instance.container_id {
            Some(id) => self.runtime.stats(id).await,
            None => None,
        }
    }
}

/// OpenTelemetry collector started like any other service
pub struct OtelCollectorPlugin {
    inner: GenericContainerPlugin,
}

impl OtelCollectorPlugin {
    pub const DEFAULT_IMAGE: &'static str = "otel/opentelemetry-collector:latest";
    pub const OTLP_GRPC_PORT: u16 = 4317;
    pub const OTLP_HTTP_PORT: u16 = 4318;

    pub fn new(inner: GenericContainerPlugin) -> Self {
        Self { inner }
    }

    fn ports(spec: &ServiceSpec) -> Vec<u16> {
        if spec.ports.is_empty() {
            vec![Self::OTLP_GRPC_PORT, Self::OTLP_HTTP_PORT]
        } else {
            spec.ports.clone()
        }
    }

    /// OTLP exporter settings pointing at the published collector port
    ///
    /// OTLP/HTTP is preferred; a collector publishing only 4317 gets gRPC.
    pub fn exporter_env(instance: &ServiceInstance) -> Vec<(String, String)> {
        let (port, protocol) = match (
            instance.host_port(Self::OTLP_HTTP_PORT),
            instance.host_port(Self::OTLP_GRPC_PORT),
        ) {
            (Some(port), _) => (port, "http/protobuf"),
            (None, Some(port)) => (port, "grpc"),
            (None, None) => match instance.ports.values().next() {
                Some(port) => (*port, "http/protobuf"),
                None => return Vec::new(),
            },
        };
        vec![
            (
                "OTEL_EXPORTER_OTLP_ENDPOINT".to_string(),
                format!("http://{}:{}", instance.host, port),
            ),
            ("OTEL_EXPORTER_OTLP_PROTOCOL".to_string(), protocol.to_string()),
        ]
    }
}

#[async_trait]
impl ServicePlugin for OtelCollectorPlugin {
    fn name(&self) -> &str {
        OTEL_COLLECTOR
    }

    async fn start(&self, spec: &ServiceSpec) -> Result<ServiceInstance> {
        let image = spec.image.as_deref().unwrap_or(Self::DEFAULT_IMAGE);
        let instance = self.inner.start_image(spec, image, &Self::ports(spec)).await?;
        info!(
            "Collector {} accepting OTLP on {:?}",
            instance.service,
            instance.ports.values().collect::<Vec<_>>()
        );
        Ok(instance)
    }

    async fn stop(&self, instance: &ServiceInstance) -> Result<()> {
        self.inner.stop(instance).await
    }

    async fn health_check(&self, instance: &ServiceInstance, spec: &ServiceSpec) -> HealthStatus {
        if spec.health_check.is_some() {
            return self.inner.exec_probe(instance, spec).await;
        }
        // Collector images ship without a shell; probe the OTLP/HTTP port instead
        let port = instance
            .host_port(Self::OTLP_HTTP_PORT)
            .or_else(|| instance.ports.values().next().copied());
        match port {
            Some(port) => tcp_probe(&instance.host, port, PROBE_TIMEOUT).await,
            None => HealthStatus::Healthy,
        }
    }

    fn exec_command(
        &self,
        instance: &ServiceInstance,
        argv: &[String],
        env: &[(String, String)],
    ) -> Option<Command> {
        self.inner.exec_command(instance, argv, env)
    }

    async fn resource_usage(&self, instance: &ServiceInstance) -> Option<ResourceUsage> {
        self.inner.resource_usage(instance).await
    }

    fn estimate(&self, _spec: &ServiceSpec) -> ResourceUsage {
        estimate_by_type(Some("collector"))
    }

    fn step_env(&self, instance: &ServiceInstance) -> Vec<(String, String)> {
        Self::exporter_env(instance)
    }
}
