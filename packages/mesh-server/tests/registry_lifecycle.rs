//! Registration, heartbeats, the background sweep and health reports.

use std::sync::Arc;
use std::time::Duration;

use meshkit_core::{
    HealthStatus, InstanceRegistration, InstanceStatus, LoadBalancerConfig, ManualClock,
};
use meshkit_server::{MeshConfig, MeshObserver, ServiceMesh};
use parking_lot::Mutex;

#[derive(Default)]
struct StatusLog(Mutex<Vec<String>>);

impl MeshObserver for StatusLog {
    fn on_status_changed(
        &self,
        service: &str,
        instance_id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) {
        self.0.lock().push(format!(
            "{service}/{instance_id}:{}->{}",
            from.as_str(),
            to.as_str()
        ));
    }
}

#[test]
fn reregistration_replaces_in_place() {
    let mesh = ServiceMesh::builder()
        .clock(Arc::new(ManualClock::new(0)))
        .build();
    mesh.register(InstanceRegistration::new("hr", "hr-1", "10.0.0.1", 80));
    mesh.register(InstanceRegistration::new("hr", "hr-2", "10.0.0.2", 80));
    mesh.register(InstanceRegistration::new("hr", "hr-1", "10.0.0.9", 81).with_version("2.0.0"));

    let instances = mesh.instances("hr").unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].id, "hr-1");
    assert_eq!(instances[0].address(), "10.0.0.9:81");
    assert_eq!(mesh.healthy_instances("hr").len(), 2);
    assert_eq!(mesh.status().circuit_breakers.total, 1);

    assert!(mesh.deregister("hr", "hr-1"));
    assert!(mesh.deregister("hr", "hr-2"));
    assert!(!mesh.deregister("hr", "hr-2"));
    assert!(mesh.instances("hr").is_none());
    // Breakers outlive instances.
    assert!(mesh.breaker_state("hr").is_some());
}

#[test]
fn heartbeats_promote_after_three_successes() {
    let mesh = ServiceMesh::builder()
        .clock(Arc::new(ManualClock::new(0)))
        .build();
    mesh.register(
        InstanceRegistration::new("ai", "ai-1", "localhost", 3005)
            .with_status(InstanceStatus::Starting),
    );
    assert!(mesh.heartbeat("ai", "ai-1"));
    assert!(mesh.heartbeat("ai", "ai-1"));
    assert!(mesh.healthy_instances("ai").is_empty());
    assert!(mesh.heartbeat("ai", "ai-1"));
    assert_eq!(mesh.healthy_instances("ai").len(), 1);
    assert!(!mesh.heartbeat("ai", "ghost"));
}

#[tokio::test(start_paused = true)]
async fn background_sweep_marks_silent_instances_unhealthy() {
    let clock = Arc::new(ManualClock::new(0));
    let log = Arc::new(StatusLog::default());
    let config = MeshConfig {
        load_balancer: LoadBalancerConfig {
            health_check_interval_ms: 100,
            ..LoadBalancerConfig::default()
        },
        ..MeshConfig::default()
    };
    let mesh = ServiceMesh::builder()
        .config(config)
        .clock(clock.clone())
        .observer(log.clone())
        .build();
    mesh.register(
        InstanceRegistration::new("logistics", "lg-1", "localhost", 3003)
            .with_heartbeat_interval(1_000),
    );
    mesh.register(
        InstanceRegistration::new("logistics", "lg-2", "localhost", 3013)
            .with_heartbeat_interval(1_000),
    );
    mesh.start_background();

    clock.advance(2_000);
    mesh.heartbeat("logistics", "lg-2");
    clock.advance(1_500);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let healthy: Vec<_> = mesh
        .healthy_instances("logistics")
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(healthy, vec!["lg-2"]);
    assert_eq!(
        log.0.lock().clone(),
        vec!["logistics/lg-1:healthy->unhealthy".to_string()]
    );

    let report = mesh.check_instance("logistics", "lg-1");
    assert_eq!(report.checks.len(), 3);
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(mesh.check_all().len(), 2);

    mesh.shutdown().await;
}
