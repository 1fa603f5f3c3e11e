//! Pool of idle, healthy service instances keyed by reuse key
//!
//! Eviction is TTL since last release: an instance that sits idle for longer
//! than the TTL is handed back to its plugin to be stopped.

use clnrm_common::{LifecycleState, ReuseKey, ServiceInstance};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct PooledEntry {
    instance: ServiceInstance,
    released_at: Instant,
}

/// Counters exposed by `reuse_stats()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReuseStats {
    /// Instances created through a plugin
    pub created: usize,
    /// Claims satisfied from the pool
    pub reused: usize,
    /// Instances currently idle in the pool
    pub idle: usize,
}

/// Shared across all workers
///
/// Claim and release go through the map's per-key entry lock, so one idle
/// instance is handed to at most one caller.
pub struct ReusePool {
    idle: DashMap<ReuseKey, Vec<PooledEntry>>,
    ttl: Duration,
    created: AtomicUsize,
    reused: AtomicUsize,
}

impl ReusePool {
    pub fn new(ttl: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            ttl,
            created: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    /// Take the most recently released, unexpired instance for a key
    pub fn claim(&self, key: &ReuseKey) -> Option<ServiceInstance> {
        let mut entries = self.idle.get_mut(key)?;
        let pos = entries
            .iter()
            .rposition(|entry| entry.released_at.elapsed() < self.ttl)?;
        let entry = entries.remove(pos);
        drop(entries);
        self.idle.remove_if(key, |_, entries| entries.is_empty());

        self.reused.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Claimed pooled {} ({}) for key {}",
            entry.instance.service, entry.instance.id, key
        );
        Some(entry.instance)
    }

    /// Put an instance back; anything not `Healthy` is returned to the caller
    pub fn release(&self, instance: ServiceInstance) -> Result<(), ServiceInstance> {
        if instance.state != LifecycleState::Healthy {
            return Err(instance);
        }
        debug!(
            "Released {} ({}) to pool under {}",
            instance.service, instance.id, instance.reuse_key
        );
        self.idle
            .entry(instance.reuse_key.clone())
            .or_default()
            .push(PooledEntry {
                instance,
                released_at: Instant::now(),
            });
        Ok(())
    }

    /// Remove and return every instance idle for longer than the TTL
    pub fn evict_expired(&self) -> Vec<ServiceInstance> {
        let mut expired = Vec::new();
        for mut entries in self.idle.iter_mut() {
            let (keep, evict): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|entry| entry.released_at.elapsed() < self.ttl);
            *entries = keep;
            expired.extend(evict.into_iter().map(|entry| entry.instance));
        }
        self.idle.retain(|_, entries| !entries.is_empty());
        expired
    }

    /// Remove and return everything
    pub fn drain(&self) -> Vec<ServiceInstance> {
        let keys: Vec<ReuseKey> = self.idle.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.idle.remove(&key))
            .flat_map(|(_, entries)| entries.into_iter().map(|entry| entry.instance))
            .collect()
    }

    /// Copies of the idle instances
    pub fn snapshot(&self) -> Vec<ServiceInstance> {
        self.idle
            .iter()
            .flat_map(|e| e.value().iter().map(|entry| entry.instance.clone()).collect::<Vec<_>>())
            .collect()
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ReuseStats {
        ReuseStats {
            created: self.created.load(Ordering::SeqCst),
            reused: self.reused.load(Ordering::SeqCst),
            idle: self.idle.iter().map(|e| e.value().len()).sum(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
