//! In-process doubles for exercising the engine without a container runtime
//!
//! `MockPlugin` "starts" services instantly and runs their exec commands and
//! health checks on the host, so definitions written for it behave like real
//! ones minus the isolation.

use async_trait::async_trait;
use clnrm_common::{
    Error, HealthStatus, LifecycleState, ResourceUsage, Result, ServiceInstance, ServiceSpec,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::Command;

use crate::plugin::ServicePlugin;

pub use crate::trace::MemoryTraceSink;

/// Counting plugin with per-service failure injection
#[derive(Default)]
pub struct MockPlugin {
    unhealthy: HashSet<String>,
    failing_start: HashSet<String>,
    panic_on_exec: HashSet<String>,
    panic_on_start: HashSet<String>,
    usage: Option<ResourceUsage>,
    start_delay: Option<Duration>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    health_checks: AtomicUsize,
    start_order: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, LifecycleState>>,
}

impl MockPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every health check of this service fails
    pub fn unhealthy(mut self, service: &str) -> Self {
        self.unhealthy.insert(service.to_string());
        self
    }

    /// `start` of this service returns an error
    pub fn failing_start(mut self, service: &str) -> Self {
        self.failing_start.insert(service.to_string());
        self
    }

    /// Building an exec command for this service panics
    pub fn panic_on_exec(mut self, service: &str) -> Self {
        self.panic_on_exec.insert(service.to_string());
        self
    }

    /// `start` of this service panics, outside any step body
    pub fn panic_on_start(mut self, service: &str) -> Self {
        self.panic_on_start.insert(service.to_string());
        self
    }

    /// Report this usage for every instance
    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Services in the order `start` was called
    pub fn start_order(&self) -> Vec<String> {
        self.start_order.lock().clone()
    }

    /// Instances started and not yet stopped
    pub fn running(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|s| **s != LifecycleState::Stopped)
            .count()
    }

    pub fn all_stopped(&self) -> bool {
        self.running() == 0
    }

    /// Last known state per instance id
    pub fn instance_states(&self) -> HashMap<String, LifecycleState> {
        self.states.lock().clone()
    }

    fn host_command(argv: &[String], env: &[(String, String)]) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Some(cmd)
    }
}

#[async_trait]
impl ServicePlugin for MockPlugin {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, spec: &ServiceSpec) -> Result<ServiceInstance> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.start_order.lock().push(spec.name.clone());
        self.starts.fetch_add(1, Ordering::SeqCst);

        if self.panic_on_start.contains(&spec.name) {
            panic!("injected start panic for {}", spec.name);
        }
        if self.failing_start.contains(&spec.name) {
            return Err(Error::Internal(format!("injected start failure for {}", spec.name)));
        }

        let mut instance = ServiceInstance::new(&spec.name, self.name(), spec.reuse_key());
        instance.state = LifecycleState::Starting;
        for port in &spec.ports {
            instance.ports.insert(*port, *port);
        }
        self.states.lock().insert(instance.id.clone(), instance.state);
        Ok(instance)
    }

    async fn stop(&self, instance: &ServiceInstance) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .insert(instance.id.clone(), LifecycleState::Stopped);
        Ok(())
    }

    async fn health_check(&self, instance: &ServiceInstance, spec: &ServiceSpec) -> HealthStatus {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.unhealthy.contains(&instance.service) {
            return HealthStatus::Failed("injected health failure".to_string());
        }

        let Some(check) = &spec.health_check else {
            self.states.lock().insert(instance.id.clone(), LifecycleState::Healthy);
            return HealthStatus::Healthy;
        };
        let Some(mut cmd) = Self::host_command(&check.command, &instance.connection_env()) else {
            return HealthStatus::Failed("empty health check command".to_string());
        };

        let status = match cmd.output().await {
            Err(e) => HealthStatus::Failed(e.to_string()),
            Ok(output) if !output.status.success() => {
                HealthStatus::Failed(format!("health check exited with {}", output.status))
            }
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout);
                match &check.pattern {
                    Some(pattern) => match regex::Regex::new(pattern) {
                        Ok(re) if re.is_match(&text) => HealthStatus::Healthy,
                        Ok(_) => HealthStatus::Degraded(format!("output did not match /{}/", pattern)),
                        Err(e) => HealthStatus::Failed(e.to_string()),
                    },
                    None => HealthStatus::Healthy,
                }
            }
        };
        if status.is_healthy() {
            self.states.lock().insert(instance.id.clone(), LifecycleState::Healthy);
        }
        status
    }

    fn exec_command(
        &self,
        instance: &ServiceInstance,
        argv: &[String],
        env: &[(String, String)],
    ) -> Option<Command> {
        if self.panic_on_exec.contains(&instance.service) {
            panic!("injected exec panic for {}", instance.service);
        }
        Self::host_command(argv, env)
    }

    async fn resource_usage(&self, _instance: &ServiceInstance) -> Option<ResourceUsage> {
        self.usage
    }

    fn estimate(&self, _spec: &ServiceSpec) -> ResourceUsage {
        ResourceUsage::new(0.25, 128.0)
    }
}
