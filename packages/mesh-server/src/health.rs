//! Health aggregation: derives a per-instance verdict from live registry state.

use std::sync::Arc;

use meshkit_core::{
    CheckStatus, ClockSource, HealthCheckResult, HealthStatus, ServiceHealthReport,
    ServiceInstance,
};

use crate::registry::ServiceRegistry;

const HEARTBEAT_PASS_MS: f64 = 30_000.0;
const HEARTBEAT_WARN_MS: f64 = 60_000.0;
const ERROR_RATE_PASS: f64 = 0.01;
const ERROR_RATE_WARN: f64 = 0.05;
const LATENCY_PASS_MS: f64 = 100.0;
const LATENCY_WARN_MS: f64 = 500.0;

/// Computes [`ServiceHealthReport`]s on demand. Nothing is cached.
pub struct HealthAggregator {
    registry: Arc<ServiceRegistry>,
    clock: Arc<dyn ClockSource>,
}

impl HealthAggregator {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, clock: Arc<dyn ClockSource>) -> Self {
        Self { registry, clock }
    }

    /// Runs the heartbeat, error-rate and response-time checks against one
    /// instance. An unknown instance yields an `unhealthy` report with a
    /// single failing `existence` check.
    #[must_use]
    pub fn check_instance(&self, service: &str, instance_id: &str) -> ServiceHealthReport {
        match self.registry.instance(service, instance_id) {
            Some(instance) => self.report(&instance),
            None => ServiceHealthReport {
                service_name: service.to_string(),
                instance_id: instance_id.to_string(),
                status: HealthStatus::Unhealthy,
                checks: vec![HealthCheckResult {
                    name: "existence".to_string(),
                    status: CheckStatus::Fail,
                    message: Some("Service instance not found".to_string()),
                    duration_ms: 0,
                }],
                uptime_ms: 0,
                timestamp: self.clock.now(),
            },
        }
    }

    /// Reports for every registered instance, ordered by service name.
    #[must_use]
    pub fn check_all(&self) -> Vec<ServiceHealthReport> {
        self.registry
            .list_all()
            .values()
            .flatten()
            .map(|instance| self.report(instance))
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self, instance: &ServiceInstance) -> ServiceHealthReport {
        let started = self.clock.now();
        let elapsed = || self.clock.now().saturating_sub(started);
        let mut checks = Vec::with_capacity(3);

        let age = instance.heartbeat_age(started);
        checks.push(HealthCheckResult {
            name: "heartbeat".to_string(),
            status: CheckStatus::grade(age as f64, HEARTBEAT_PASS_MS, HEARTBEAT_WARN_MS),
            message: Some(format!("Last heartbeat {}s ago", (age + 500) / 1000)),
            duration_ms: elapsed(),
        });

        let error_rate = instance.metrics.error_rate();
        checks.push(HealthCheckResult {
            name: "error-rate".to_string(),
            status: CheckStatus::grade(error_rate, ERROR_RATE_PASS, ERROR_RATE_WARN),
            message: Some(format!("Error rate: {:.2}%", error_rate * 100.0)),
            duration_ms: elapsed(),
        });

        let latency = instance.metrics.avg_response_time_ms;
        checks.push(HealthCheckResult {
            name: "response-time".to_string(),
            status: CheckStatus::grade(latency, LATENCY_PASS_MS, LATENCY_WARN_MS),
            message: Some(format!("Avg response time: {latency:.2}ms")),
            duration_ms: elapsed(),
        });

        let now = self.clock.now();
        ServiceHealthReport {
            service_name: instance.name.clone(),
            instance_id: instance.id.clone(),
            status: HealthStatus::from_checks(&checks),
            checks,
            uptime_ms: now.saturating_sub(instance.registered_at),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use meshkit_core::{CircuitBreakerConfig, InstanceRegistration, ManualClock};

    use super::*;
    use crate::breaker::CircuitBreakerRegistry;
    use crate::observer::CompositeMeshObserver;

    fn setup() -> (HealthAggregator, Arc<ServiceRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let observer = Arc::new(CompositeMeshObserver::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
            clock.clone(),
            observer.clone(),
        ));
        let registry = Arc::new(ServiceRegistry::new(breakers, clock.clone(), observer, 3));
        registry.register(InstanceRegistration::new("billing", "b-1", "localhost", 80));
        (
            HealthAggregator::new(registry.clone(), clock.clone()),
            registry,
            clock,
        )
    }

    fn status_of(report: &ServiceHealthReport, name: &str) -> CheckStatus {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap()
    }

    #[test]
    fn fresh_instance_is_healthy() {
        let (health, _, clock) = setup();
        clock.advance(1_000);
        let report = health.check_instance("billing", "b-1");
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 3);
        assert_eq!(report.uptime_ms, 1_000);
    }

    #[test]
    fn heartbeat_age_thresholds() {
        let (health, _, clock) = setup();
        clock.advance(30_000);
        let report = health.check_instance("billing", "b-1");
        assert_eq!(status_of(&report, "heartbeat"), CheckStatus::Warn);
        assert_eq!(report.status, HealthStatus::Degraded);

        clock.advance(30_000);
        let report = health.check_instance("billing", "b-1");
        assert_eq!(status_of(&report, "heartbeat"), CheckStatus::Fail);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn error_rate_and_latency_grade() {
        let (health, registry, _) = setup();
        for _ in 0..97 {
            registry.record_success("billing", "b-1", 150.0);
        }
        for _ in 0..3 {
            registry.record_failure("billing", "b-1");
        }
        let report = health.check_instance("billing", "b-1");
        assert_eq!(status_of(&report, "error-rate"), CheckStatus::Warn);
        assert_eq!(status_of(&report, "response-time"), CheckStatus::Warn);
        assert_eq!(report.status, HealthStatus::Degraded);

        registry.record_success("billing", "b-1", 100_000.0);
        let report = health.check_instance("billing", "b-1");
        assert_eq!(status_of(&report, "response-time"), CheckStatus::Fail);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn unknown_instance_fails_existence() {
        let (health, _, _) = setup();
        let report = health.check_instance("billing", "ghost");
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].name, "existence");
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
    }

    #[test]
    fn check_all_covers_every_instance() {
        let (health, registry, _) = setup();
        registry.register(InstanceRegistration::new("hr", "h-1", "localhost", 81));
        registry.register(InstanceRegistration::new("billing", "b-2", "localhost", 82));
        let ids: Vec<_> = health
            .check_all()
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(ids, vec!["b-1", "b-2", "h-1"]);
    }
}
