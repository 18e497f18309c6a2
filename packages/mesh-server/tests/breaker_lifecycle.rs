//! Circuit breaker lifecycle driven through the gateway with an injected
//! failing caller and paused tokio time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshkit_core::{
    CircuitBreakerConfig, CircuitState, GatewayRequest, InstanceRegistration, ManualClock,
    MeshStatus, RouteMethod, ServiceRoute,
};
use meshkit_server::{
    CallResponse, MeshConfig, MeshObserver, ServiceCall, ServiceCaller, ServiceMesh,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Fails while `failing` is set; counts every dispatch.
#[derive(Default)]
struct Switchable {
    failing: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl ServiceCaller for Switchable {
    async fn call(&self, call: &ServiceCall, _cancel: CancellationToken) -> anyhow::Result<CallResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("{} refused connection", call.instance.id);
        }
        Ok(CallResponse {
            status_code: 200,
            headers: BTreeMap::new(),
            body: json!({ "ok": true }),
        })
    }
}

#[derive(Default)]
struct Transitions(Mutex<Vec<(CircuitState, CircuitState)>>);

impl MeshObserver for Transitions {
    fn on_circuit_transition(&self, _service: &str, from: CircuitState, to: CircuitState) {
        self.0.lock().push((from, to));
    }

    fn on_metrics_snapshot(&self, _status: &MeshStatus) {}
}

fn setup() -> (ServiceMesh, Arc<Switchable>, Arc<Transitions>) {
    let caller = Arc::new(Switchable::default());
    let transitions = Arc::new(Transitions::default());
    let config = MeshConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 1_000,
            half_open_requests: 2,
        },
        ..MeshConfig::default()
    };
    let mesh = ServiceMesh::builder()
        .config(config)
        .clock(Arc::new(ManualClock::new(0)))
        .caller(caller.clone())
        .observer(transitions.clone())
        .build();
    mesh.register(InstanceRegistration::new("orders", "orders-1", "localhost", 9000));
    mesh.register_route(ServiceRoute::new(RouteMethod::All, "/api/orders/*", "orders"))
        .unwrap();
    (mesh, caller, transitions)
}

async fn call(mesh: &ServiceMesh) -> u16 {
    mesh.handle(GatewayRequest::new("GET", "/api/orders/42"))
        .await
        .status_code
}

fn state(mesh: &ServiceMesh) -> CircuitState {
    mesh.breaker_state("orders").unwrap().state
}

#[tokio::test(start_paused = true)]
async fn open_half_open_closed_round_trip() {
    let (mesh, caller, transitions) = setup();
    caller.failing.store(true, Ordering::SeqCst);

    for _ in 0..3 {
        assert_eq!(call(&mesh).await, 500);
    }
    assert_eq!(state(&mesh), CircuitState::Open);

    // Short-circuited without dispatch.
    assert_eq!(call(&mesh).await, 503);
    assert_eq!(caller.calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(state(&mesh), CircuitState::HalfOpen);

    caller.failing.store(false, Ordering::SeqCst);
    assert_eq!(call(&mesh).await, 200);
    assert_eq!(state(&mesh), CircuitState::HalfOpen);
    assert_eq!(call(&mesh).await, 200);

    let snapshot = mesh.breaker_state("orders").unwrap();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);

    assert_eq!(
        transitions.0.lock().clone(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
    mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failure_in_half_open_reopens_and_restarts_timer() {
    let (mesh, caller, _) = setup();
    caller.failing.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        call(&mesh).await;
    }
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(state(&mesh), CircuitState::HalfOpen);

    assert_eq!(call(&mesh).await, 500);
    assert_eq!(state(&mesh), CircuitState::Open);

    // A fresh full timeout is required again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state(&mesh), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(state(&mesh), CircuitState::HalfOpen);
    mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reset_cancels_pending_timer() {
    let (mesh, caller, transitions) = setup();
    caller.failing.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        call(&mesh).await;
    }
    assert!(mesh.reset_breaker("orders"));
    assert_eq!(state(&mesh), CircuitState::Closed);

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(state(&mesh), CircuitState::Closed);
    assert!(!transitions
        .0
        .lock()
        .contains(&(CircuitState::Open, CircuitState::HalfOpen)));
    mesh.shutdown().await;
}

#[tokio::test]
async fn unguarded_route_never_trips() {
    let (mesh, caller, _) = setup();
    mesh.register_route(
        ServiceRoute::new(RouteMethod::Get, "/raw/orders/*", "orders").with_circuit_breaker(false),
    )
    .unwrap();
    caller.failing.store(true, Ordering::SeqCst);
    for _ in 0..10 {
        let resp = mesh.handle(GatewayRequest::new("GET", "/raw/orders/1")).await;
        assert_eq!(resp.status_code, 500);
    }
    assert_eq!(state(&mesh), CircuitState::Closed);
    assert_eq!(caller.calls.load(Ordering::SeqCst), 10);
}
