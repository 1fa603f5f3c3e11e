//! Container lifecycle manager
//!
//! Turns a definition's services into running instances in dependency
//! waves, waits for each to report healthy, and tears them down in reverse.
//! With reuse enabled, healthy instances go back to the shared
//! [`ReusePool`] instead of being stopped.

use clnrm_common::{
    Error, HealthStatus, LifecycleState, ResourceUsage, Result, ServiceInstance, ServiceSpec,
    TestDefinition,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::plugin::{PluginRegistry, ServicePlugin};
use crate::reuse::{ReusePool, ReuseStats};

/// A started service together with what started it
#[derive(Clone)]
pub struct RunningService {
    pub spec: ServiceSpec,
    pub plugin: Arc<dyn ServicePlugin>,
    pub instance: ServiceInstance,
    pub reused: bool,
}

impl std::fmt::Debug for RunningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningService")
            .field("spec", &self.spec)
            .field("instance", &self.instance)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

/// The services of one run, in start order
#[derive(Debug, Default)]
pub struct ServiceGroup {
    services: Vec<RunningService>,
}

impl ServiceGroup {
    pub fn get(&self, name: &str) -> Option<&RunningService> {
        self.services.iter().find(|s| s.spec.name == name)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.services.iter().map(|s| &s.instance)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Connection variables for every service in the group, plus whatever
    /// the plugins hand to steps (such as a collector's OTLP endpoint)
    pub fn connection_env(&self) -> Vec<(String, String)> {
        self.services
            .iter()
            .flat_map(|s| {
                let mut env = s.instance.connection_env();
                env.extend(s.plugin.step_env(&s.instance));
                env
            })
            .collect()
    }

    /// Command running `argv` inside a service; None means run it on the host
    pub fn exec_command(
        &self,
        service: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Option<Command> {
        self.get(service)
            .and_then(|s| s.plugin.exec_command(&s.instance, argv, env))
    }

    /// Summed live usage, None unless every service could report it
    pub async fn resource_usage(&self) -> Option<ResourceUsage> {
        if self.services.is_empty() {
            return None;
        }
        let usages = join_all(
            self.services
                .iter()
                .map(|s| s.plugin.resource_usage(&s.instance)),
        )
        .await;
        usages
            .into_iter()
            .try_fold(ResourceUsage::default(), |acc, usage| usage.map(|u| acc + u))
    }
}

pub struct LifecycleManager {
    registry: Arc<PluginRegistry>,
    config: LifecycleConfig,
    pool: Arc<ReusePool>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<PluginRegistry>, config: LifecycleConfig) -> Self {
        let pool = Arc::new(ReusePool::new(config.reuse_ttl));
        Self {
            registry,
            config,
            pool,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn reuse_enabled(&self) -> bool {
        self.config.reuse_containers
    }

    pub fn reuse_stats(&self) -> ReuseStats {
        self.pool.stats()
    }

    /// Idle pooled instances
    pub fn pooled(&self) -> Vec<ServiceInstance> {
        self.pool.snapshot()
    }

    /// Start every service of a definition, dependencies first
    ///
    /// Services in the same wave start concurrently. If any service fails,
    /// the remaining waves are not attempted and everything already started
    /// is torn down before the error is returned.
    pub async fn start_all(
        &self,
        definition: &TestDefinition,
        cancel: &CancellationToken,
    ) -> Result<ServiceGroup> {
        let mut group = ServiceGroup::default();
        if definition.services.is_empty() {
            return Ok(group);
        }

        // Resolve everything up front so a bad name cannot strand a half-started group
        let waves = definition.dependency_waves()?;
        let mut plugins = HashMap::new();
        for spec in definition.services.values() {
            plugins.insert(spec.name.as_str(), self.registry.resolve_for(spec)?);
        }

        if self.config.reuse_containers {
            self.evict_expired().await;
        }

        for wave in waves {
            if cancel.is_cancelled() {
                self.stop_all(group).await;
                return Err(Error::Cancelled);
            }

            debug!("Starting wave {:?}", wave);
            let starts = wave.iter().filter_map(|name| {
                let spec = definition.services.get(name)?;
                let plugin = plugins.get(name.as_str())?.clone();
                Some(self.acquire(spec.clone(), plugin, cancel))
            });

            let mut failure = None;
            for result in join_all(starts).await {
                match result {
                    Ok(service) => group.services.push(service),
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }

            if let Some(err) = failure {
                warn!("Service start failed, tearing down {} started service(s)", group.len());
                self.stop_all(group).await;
                return Err(err);
            }
        }

        info!(
            "All {} service(s) healthy for {}",
            group.len(),
            definition.name
        );
        Ok(group)
    }

    /// Claim a pooled instance or start a new one, then wait for health
    ///
    /// An instance that starts but never turns healthy is stopped here.
    async fn acquire(
        &self,
        spec: ServiceSpec,
        plugin: Arc<dyn ServicePlugin>,
        cancel: &CancellationToken,
    ) -> Result<RunningService> {
        if self.config.reuse_containers {
            let key = spec.reuse_key();
            while let Some(mut instance) = self.pool.claim(&key) {
                // Pooled instances were healthy when released; check they still are
                match plugin.health_check(&instance, &spec).await {
                    HealthStatus::Healthy => {
                        info!(service = %spec.name, "Reusing pooled instance {}", instance.id);
                        instance.state = LifecycleState::Healthy;
                        return Ok(RunningService {
                            spec,
                            plugin,
                            instance,
                            reused: true,
                        });
                    }
                    status => {
                        warn!(service = %spec.name, "Pooled instance unhealthy ({:?}), discarding", status);
                        stop_instance(plugin.as_ref(), instance).await;
                    }
                }
            }
        }

        info!(service = %spec.name, plugin = %spec.plugin, "Starting service");
        let mut instance = match plugin.start(&spec).await {
            Ok(instance) => instance,
            Err(err @ (Error::Infrastructure(_) | Error::Cancelled)) => return Err(err),
            Err(err) => {
                return Err(Error::ServiceStart {
                    service: spec.name.clone(),
                    plugin: spec.plugin.clone(),
                    last_state: LifecycleState::Pending,
                    reason: err.to_string(),
                })
            }
        };
        self.pool.record_created();

        match self.wait_healthy(plugin.as_ref(), &mut instance, &spec, cancel).await {
            Ok(()) => Ok(RunningService {
                spec,
                plugin,
                instance,
                reused: false,
            }),
            Err(err) => {
                stop_instance(plugin.as_ref(), instance).await;
                Err(err)
            }
        }
    }

    /// Poll health with exponential backoff until healthy or the max wait passes
    async fn wait_healthy(
        &self,
        plugin: &dyn ServicePlugin,
        instance: &mut ServiceInstance,
        spec: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let start = Instant::now();
        let mut backoff = self.config.health_initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match plugin.health_check(instance, spec).await {
                HealthStatus::Healthy => {
                    instance.state = LifecycleState::Healthy;
                    info!(
                        service = %spec.name,
                        "Healthy after {} probe(s) in {:?}",
                        attempts,
                        start.elapsed()
                    );
                    return Ok(());
                }
                HealthStatus::Degraded(reason) => {
                    instance.state = LifecycleState::Degraded;
                    debug!(service = %spec.name, "Degraded: {}", reason);
                }
                HealthStatus::Failed(reason) => {
                    debug!(service = %spec.name, "Health probe failed: {}", reason);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.config.health_max_wait {
                return Err(Error::HealthCheckTimeout {
                    service: spec.name.clone(),
                    waited: elapsed,
                });
            }

            let sleep_for = backoff.min(self.config.health_max_wait - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
            backoff = (backoff * 2).min(self.config.health_max_backoff);
        }
    }

    /// Tear a group down in reverse start order
    ///
    /// Best effort: a failed stop is logged and the rest still stop. With
    /// reuse on, healthy instances are released to the pool instead.
    pub async fn stop_all(&self, group: ServiceGroup) -> Vec<ServiceInstance> {
        let mut finished = Vec::with_capacity(group.services.len());

        for service in group.services.into_iter().rev() {
            let RunningService {
                spec, plugin, instance, ..
            } = service;

            if self.config.reuse_containers {
                match self.pool.release(instance) {
                    Ok(()) => {
                        debug!(service = %spec.name, "Released to reuse pool");
                        continue;
                    }
                    Err(instance) => finished.push(stop_instance(plugin.as_ref(), instance).await),
                }
            } else {
                finished.push(stop_instance(plugin.as_ref(), instance).await);
            }
        }

        finished
    }

    /// Stop pooled instances whose TTL has run out
    pub async fn evict_expired(&self) -> usize {
        let expired = self.pool.evict_expired();
        let count = expired.len();
        for instance in expired {
            info!(service = %instance.service, "Evicting idle instance {}", instance.id);
            self.stop_detached(instance).await;
        }
        count
    }

    /// Stop everything left in the reuse pool
    pub async fn shutdown(&self) -> usize {
        let drained = self.pool.drain();
        let count = drained.len();
        if count > 0 {
            info!("Stopping {} pooled instance(s)", count);
        }
        for instance in drained {
            self.stop_detached(instance).await;
        }
        count
    }

    async fn stop_detached(&self, instance: ServiceInstance) {
        match self.registry.resolve(&instance.plugin) {
            Ok(plugin) => {
                stop_instance(plugin.as_ref(), instance).await;
            }
            Err(e) => warn!("Cannot stop {}: {}", instance.id, e),
        }
    }
}

async fn stop_instance(plugin: &dyn ServicePlugin, mut instance: ServiceInstance) -> ServiceInstance {
    if let Err(e) = plugin.stop(&instance).await {
        warn!(service = %instance.service, "Failed to stop instance {}: {}", instance.id, e);
    } else {
        debug!(service = %instance.service, "Stopped instance {}", instance.id);
    }
    instance.state = LifecycleState::Stopped;
    instance
}

/// Health poll schedule for a config, useful for logging expectations
pub fn backoff_schedule(config: &LifecycleConfig) -> Vec<Duration> {
    let mut schedule = Vec::new();
    let mut total = Duration::ZERO;
    let mut backoff = config.health_initial_backoff;
    while total < config.health_max_wait && !backoff.is_zero() {
        let step = backoff.min(config.health_max_wait - total);
        schedule.push(step);
        total += step;
        backoff = (backoff * 2).min(config.health_max_backoff);
    }
    schedule
}
