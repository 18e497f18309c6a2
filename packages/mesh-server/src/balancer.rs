//! Instance selection over a service's healthy instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use meshkit_core::hash::bucket_for;
use meshkit_core::{LoadBalancerConfig, LoadBalancingStrategy, ServiceInstance};
use rand::Rng;
use tracing::info;

use crate::registry::ServiceRegistry;

/// Picks one healthy instance per call according to the active strategy.
///
/// The config is swapped atomically; readers never block. Round-robin keeps
/// one counter per service.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    config: ArcSwap<LoadBalancerConfig>,
    counters: DashMap<String, Arc<AtomicU64>>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, config: LoadBalancerConfig) -> Self {
        Self {
            registry,
            config: ArcSwap::from_pointee(config),
            counters: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> LoadBalancerConfig {
        self.config.load().as_ref().clone()
    }

    #[must_use]
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.config.load().strategy
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        self.config.rcu(|current| {
            let mut next = LoadBalancerConfig::clone(current);
            next.strategy = strategy;
            next
        });
        info!(strategy = %strategy, "load balancer strategy changed");
    }

    /// Selects an instance of `service`, or `None` when it has no healthy
    /// instance. `client_ip` feeds the ip-hash strategy.
    #[must_use]
    pub fn select(&self, service: &str, client_ip: Option<&str>) -> Option<ServiceInstance> {
        let mut healthy = self.registry.healthy(service);
        if healthy.is_empty() {
            return None;
        }
        let index = match self.strategy() {
            LoadBalancingStrategy::RoundRobin => self.next_round_robin(service, healthy.len()),
            LoadBalancingStrategy::LeastConnections => self.least_connections(service, &healthy),
            LoadBalancingStrategy::Weighted => weighted_index(&healthy, &mut rand::rng()),
            LoadBalancingStrategy::Random => rand::rng().random_range(0..healthy.len()),
            LoadBalancingStrategy::IpHash => client_ip.map_or(0, |ip| bucket_for(ip, healthy.len())),
        };
        Some(healthy.swap_remove(index))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn next_round_robin(&self, service: &str, len: usize) -> usize {
        let counter = self
            .counters
            .entry(service.to_string())
            .or_default()
            .clone();
        let n = counter.fetch_add(1, Ordering::Relaxed);
        (n % len as u64) as usize
    }

    fn least_connections(&self, service: &str, instances: &[ServiceInstance]) -> usize {
        let mut best = 0;
        let mut best_count = u64::MAX;
        for (i, instance) in instances.iter().enumerate() {
            let count = self.registry.active_connections(service, &instance.id);
            if count < best_count {
                best = i;
                best_count = count;
            }
        }
        best
    }
}

/// Draws in `[0, total_weight)` and walks the list subtracting each weight
/// until the draw goes non-positive.
#[allow(clippy::cast_precision_loss)]
fn weighted_index<R: Rng>(instances: &[ServiceInstance], rng: &mut R) -> usize {
    let total: u64 = instances
        .iter()
        .map(|i| u64::from(i.metadata.effective_weight()))
        .sum();
    let mut remaining = rng.random_range(0.0..total as f64);
    for (i, instance) in instances.iter().enumerate() {
        remaining -= f64::from(instance.metadata.effective_weight());
        if remaining <= 0.0 {
            return i;
        }
    }
    0
}
