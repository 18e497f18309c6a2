//! Service registry: instances per logical service name, heartbeats and
//! health sweeps.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use meshkit_core::{ClockSource, InstanceRegistration, InstanceStatus, ServiceInstance};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::observer::MeshObserver;

/// Consecutive heartbeats needed to promote an instance back to healthy.
const PROMOTE_AFTER_SUCCESSES: u32 = 3;

// ---------------------------------------------------------------------------
// ConnectionGuard
// ---------------------------------------------------------------------------

/// RAII guard counting one in-flight call against an instance.
///
/// The counter is decremented on drop, even if the caller panics.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry of service instances keyed by service name.
///
/// Each service's instance list lives under its own `DashMap` entry, so
/// concurrent updates to the same service serialize on that entry while
/// other services proceed. Observers are notified after the entry lock is
/// released.
pub struct ServiceRegistry {
    services: DashMap<String, Vec<ServiceInstance>>,
    /// In-flight call counters keyed by `service/instance`.
    connections: DashMap<String, Arc<AtomicU64>>,
    breakers: Arc<CircuitBreakerRegistry>,
    clock: Arc<dyn ClockSource>,
    observer: Arc<dyn MeshObserver>,
    stale_multiplier: u64,
}

fn connection_key(service: &str, instance_id: &str) -> String {
    format!("{service}/{instance_id}")
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        clock: Arc<dyn ClockSource>,
        observer: Arc<dyn MeshObserver>,
        stale_multiplier: u64,
    ) -> Self {
        Self {
            services: DashMap::new(),
            connections: DashMap::new(),
            breakers,
            clock,
            observer,
            stale_multiplier,
        }
    }

    /// Registers an instance, replacing any existing instance with the same id
    /// in place. Creates the service's breaker on first sight.
    pub fn register(&self, registration: InstanceRegistration) -> ServiceInstance {
        let instance = ServiceInstance::from_registration(registration, self.clock.now());
        {
            let mut instances = self.services.entry(instance.name.clone()).or_default();
            match instances.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => *existing = instance.clone(),
                None => instances.push(instance.clone()),
            }
        }
        self.breakers.ensure(&instance.name);

        info!(
            service = %instance.name,
            instance_id = %instance.id,
            version = %instance.version,
            address = %instance.address(),
            "service registered"
        );
        self.observer.on_registered(&instance);
        instance
    }

    /// Removes an instance. The service entry disappears with its last
    /// instance; its breaker is kept.
    pub fn deregister(&self, service: &str, instance_id: &str) -> bool {
        let removed = {
            let Some(mut instances) = self.services.get_mut(service) else {
                return false;
            };
            let Some(index) = instances.iter().position(|i| i.id == instance_id) else {
                return false;
            };
            instances.remove(index);
            instances.is_empty()
        };
        if removed {
            self.services.remove_if(service, |_, v| v.is_empty());
        }
        self.connections.remove(&connection_key(service, instance_id));

        info!(service = %service, instance_id = %instance_id, "service deregistered");
        self.observer.on_deregistered(service, instance_id);
        true
    }

    /// Records a heartbeat. Resets the failure streak and promotes a
    /// `starting`/`unhealthy` instance after three consecutive heartbeats.
    pub fn heartbeat(&self, service: &str, instance_id: &str) -> bool {
        let now = self.clock.now();
        let transition = {
            let Some(mut instances) = self.services.get_mut(service) else {
                return false;
            };
            let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) else {
                return false;
            };
            instance.last_heartbeat = now;
            instance.health_check.consecutive_failures = 0;
            instance.health_check.consecutive_successes += 1;

            let promotable = matches!(
                instance.status,
                InstanceStatus::Unhealthy | InstanceStatus::Starting
            );
            if promotable && instance.health_check.consecutive_successes >= PROMOTE_AFTER_SUCCESSES {
                let from = instance.status;
                instance.status = InstanceStatus::Healthy;
                Some(from)
            } else {
                None
            }
        };

        if let Some(from) = transition {
            info!(service = %service, instance_id = %instance_id, "instance promoted to healthy");
            self.observer
                .on_status_changed(service, instance_id, from, InstanceStatus::Healthy);
        }
        true
    }

    /// Sets an instance's status explicitly. Also refreshes its heartbeat.
    pub fn set_status(&self, service: &str, instance_id: &str, status: InstanceStatus) -> bool {
        let now = self.clock.now();
        let from = {
            let Some(mut instances) = self.services.get_mut(service) else {
                return false;
            };
            let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) else {
                return false;
            };
            let from = instance.status;
            instance.status = status;
            instance.last_heartbeat = now;
            from
        };

        if from != status {
            debug!(
                service = %service,
                instance_id = %instance_id,
                from = from.as_str(),
                to = status.as_str(),
                "instance status updated"
            );
            self.observer.on_status_changed(service, instance_id, from, status);
        }
        true
    }

    /// All instances of a service, or `None` if the name is unknown.
    #[must_use]
    pub fn instances(&self, service: &str) -> Option<Vec<ServiceInstance>> {
        self.services.get(service).map(|entry| entry.value().clone())
    }

    /// A single instance.
    #[must_use]
    pub fn instance(&self, service: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.services
            .get(service)
            .and_then(|entry| entry.iter().find(|i| i.id == instance_id).cloned())
    }

    /// Instances with status `healthy`, in registration order.
    #[must_use]
    pub fn healthy(&self, service: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service)
            .map(|entry| entry.iter().filter(|i| i.is_healthy()).cloned().collect())
            .unwrap_or_default()
    }

    /// Every service and its instances, ordered by service name.
    #[must_use]
    pub fn list_all(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|entry| entry.len()).sum()
    }

    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.services
            .iter()
            .map(|entry| entry.iter().filter(|i| i.is_healthy()).count())
            .sum()
    }

    /// Folds a successful call into the instance's metrics.
    pub fn record_success(&self, service: &str, instance_id: &str, latency_ms: f64) {
        if let Some(mut instances) = self.services.get_mut(service) {
            if let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) {
                instance.metrics.record_success(latency_ms);
            }
        }
    }

    /// Counts a failed call against the instance.
    pub fn record_failure(&self, service: &str, instance_id: &str) {
        if let Some(mut instances) = self.services.get_mut(service) {
            if let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) {
                instance.metrics.record_failure();
            }
        }
    }

    /// Starts tracking one in-flight call against an instance.
    #[must_use]
    pub fn track_connection(&self, service: &str, instance_id: &str) -> ConnectionGuard {
        let counter = self
            .connections
            .entry(connection_key(service, instance_id))
            .or_default()
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { counter }
    }

    /// Calls currently in flight against an instance.
    #[must_use]
    pub fn active_connections(&self, service: &str, instance_id: &str) -> u64 {
        self.connections
            .get(&connection_key(service, instance_id))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Marks instances whose heartbeat is older than `stale_multiplier` times
    /// their heartbeat interval as unhealthy. Returns the `(service, id)`
    /// pairs that changed status.
    pub fn sweep_stale(&self) -> Vec<(String, String)> {
        let now = self.clock.now();
        let mut changed = Vec::new();

        for mut entry in self.services.iter_mut() {
            let service = entry.key().clone();
            for instance in entry.value_mut().iter_mut() {
                let limit = instance
                    .health_check
                    .interval_ms
                    .saturating_mul(self.stale_multiplier);
                if instance.heartbeat_age(now) <= limit {
                    continue;
                }
                instance.health_check.consecutive_failures += 1;
                instance.health_check.consecutive_successes = 0;
                instance.health_check.last_check = Some(now);

                if matches!(
                    instance.status,
                    InstanceStatus::Healthy | InstanceStatus::Starting
                ) {
                    let from = instance.status;
                    instance.status = InstanceStatus::Unhealthy;
                    changed.push((service.clone(), instance.id.clone(), from));
                }
            }
        }

        for (service, instance_id, from) in &changed {
            warn!(service = %service, instance_id = %instance_id, "instance marked unhealthy: heartbeat stale");
            self.observer
                .on_status_changed(service, instance_id, *from, InstanceStatus::Unhealthy);
        }
        changed.into_iter().map(|(s, i, _)| (s, i)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use meshkit_core::{CircuitBreakerConfig, ManualClock};

    use super::*;
    use crate::observer::RecordingObserver;

    struct Fixture {
        registry: ServiceRegistry,
        clock: Arc<ManualClock>,
        observer: Arc<RecordingObserver>,
        breakers: Arc<CircuitBreakerRegistry>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let observer = Arc::new(RecordingObserver::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
            observer.clone(),
        ));
        let registry = ServiceRegistry::new(breakers.clone(), clock.clone(), observer.clone(), 3);
        Fixture {
            registry,
            clock,
            observer,
            breakers,
        }
    }

    fn reg(service: &str, id: &str) -> InstanceRegistration {
        InstanceRegistration::new(service, id, "localhost", 8080)
    }

    #[test]
    fn register_creates_breaker_and_notifies() {
        let f = fixture();
        let inst = f.registry.register(reg("billing", "b-1"));
        assert_eq!(inst.registered_at, 1_000_000);
        assert!(f.breakers.state("billing").is_some());
        assert_eq!(f.observer.entries(), vec!["registered:billing/b-1"]);
    }

    #[test]
    fn reregister_replaces_in_place() {
        let f = fixture();
        f.registry.register(reg("billing", "b-1"));
        f.registry.register(reg("billing", "b-2"));
        f.registry.register(reg("billing", "b-1").with_weight(5));

        let instances = f.registry.instances("billing").unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].id, "b-1");
        assert_eq!(instances[0].metadata.weight, Some(5));
        assert_eq!(f.registry.healthy("billing").len(), 2);
        assert_eq!(f.registry.list_all()["billing"].len(), 2);
    }

    #[test]
    fn deregister_last_instance_removes_service_keeps_breaker() {
        let f = fixture();
        f.registry.register(reg("billing", "b-1"));
        assert!(f.registry.deregister("billing", "b-1"));
        assert!(f.registry.instances("billing").is_none());
        assert!(!f.registry.contains("billing"));
        assert!(f.breakers.state("billing").is_some());
    }

    #[test]
    fn deregister_unknown_returns_false() {
        let f = fixture();
        assert!(!f.registry.deregister("nope", "x"));
        f.registry.register(reg("billing", "b-1"));
        assert!(!f.registry.deregister("billing", "x"));
    }

    #[test]
    fn heartbeat_promotes_after_three_successes() {
        let f = fixture();
        f.registry
            .register(reg("billing", "b-1").with_status(InstanceStatus::Unhealthy));

        assert!(f.registry.heartbeat("billing", "b-1"));
        assert!(f.registry.heartbeat("billing", "b-1"));
        assert_eq!(
            f.registry.instance("billing", "b-1").unwrap().status,
            InstanceStatus::Unhealthy
        );
        assert!(f.registry.heartbeat("billing", "b-1"));
        let inst = f.registry.instance("billing", "b-1").unwrap();
        assert_eq!(inst.status, InstanceStatus::Healthy);
        assert_eq!(inst.health_check.consecutive_failures, 0);
        assert!(f
            .observer
            .entries()
            .contains(&"status:billing/b-1:unhealthy->healthy".to_string()));
    }

    #[test]
    fn heartbeat_never_promotes_stopping() {
        let f = fixture();
        f.registry
            .register(reg("billing", "b-1").with_status(InstanceStatus::Stopping));
        for _ in 0..5 {
            f.registry.heartbeat("billing", "b-1");
        }
        assert_eq!(
            f.registry.instance("billing", "b-1").unwrap().status,
            InstanceStatus::Stopping
        );
    }

    #[test]
    fn heartbeat_unknown_returns_false() {
        let f = fixture();
        assert!(!f.registry.heartbeat("billing", "b-1"));
    }

    #[test]
    fn set_status_filters_healthy() {
        let f = fixture();
        f.registry.register(reg("billing", "b-1"));
        f.registry.register(reg("billing", "b-2"));
        assert!(f
            .registry
            .set_status("billing", "b-2", InstanceStatus::Stopping));

        let healthy = f.registry.healthy("billing");
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "b-1");
        assert_eq!(f.registry.healthy_count(), 1);
        assert_eq!(f.registry.instance_count(), 2);
    }

    #[test]
    fn sweep_marks_stale_instances_unhealthy() {
        let f = fixture();
        f.registry
            .register(reg("billing", "b-1").with_heartbeat_interval(1_000));
        f.registry
            .register(reg("billing", "b-2").with_heartbeat_interval(1_000));

        // Exactly at 3x is not stale yet.
        f.clock.advance(3_000);
        f.registry.heartbeat("billing", "b-2");
        assert!(f.registry.sweep_stale().is_empty());

        f.clock.advance(1);
        let changed = f.registry.sweep_stale();
        assert_eq!(changed, vec![("billing".to_string(), "b-1".to_string())]);

        let b1 = f.registry.instance("billing", "b-1").unwrap();
        assert_eq!(b1.status, InstanceStatus::Unhealthy);
        assert_eq!(b1.health_check.consecutive_failures, 1);
        assert_eq!(b1.health_check.last_check, Some(f.clock.now()));
        assert!(f
            .observer
            .entries()
            .contains(&"status:billing/b-1:healthy->unhealthy".to_string()));

        // Already unhealthy: counted but not re-announced.
        f.clock.advance(10);
        assert!(f.registry.sweep_stale().is_empty());
        assert_eq!(
            f.registry
                .instance("billing", "b-1")
                .unwrap()
                .health_check
                .consecutive_failures,
            2
        );
    }

    #[test]
    fn connection_guard_tracks_in_flight() {
        let f = fixture();
        f.registry.register(reg("billing", "b-1"));
        let g1 = f.registry.track_connection("billing", "b-1");
        let g2 = f.registry.track_connection("billing", "b-1");
        assert_eq!(f.registry.active_connections("billing", "b-1"), 2);
        drop(g1);
        assert_eq!(f.registry.active_connections("billing", "b-1"), 1);
        drop(g2);
        assert_eq!(f.registry.active_connections("billing", "b-1"), 0);
    }

    #[test]
    fn metrics_recorded_per_instance() {
        let f = fixture();
        f.registry.register(reg("billing", "b-1"));
        f.registry.record_success("billing", "b-1", 20.0);
        f.registry.record_failure("billing", "b-1");
        let m = f.registry.instance("billing", "b-1").unwrap().metrics;
        assert_eq!(m.request_count, 2);
        assert_eq!(m.error_count, 1);
    }
}
