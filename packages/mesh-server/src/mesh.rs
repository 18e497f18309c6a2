//! `ServiceMesh`: wires every component together behind one handle.
//!
//! Construction goes through [`ServiceMeshBuilder`]; the clock, dispatch
//! seam and observer are injectable so tests can drive the mesh
//! deterministically.

use std::sync::Arc;

use meshkit_core::{
    CircuitBreakerConfigPatch, CircuitBreakerSnapshot, ClockSource, DeadLetter, EventMessage,
    GatewayRequest, GatewayResponse, InstanceMetadata, InstanceRegistration, InstanceStatus,
    LoadBalancingStrategy, MeshStatus, NewEvent, RouteMethod, ServiceHealthReport,
    ServiceInstance, ServiceRoute, SystemClock,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::LoadBalancer;
use crate::breaker::CircuitBreakerRegistry;
use crate::config::MeshConfig;
use crate::descriptor;
use crate::error::MeshError;
use crate::event_bus::{EventBus, EventHandler, Subscription};
use crate::gateway::middleware::{build_gateway_pipeline, GatewayPipeline};
use crate::gateway::service::GatewayService;
use crate::gateway::{Gateway, GatewayContext, RouteTable, ServiceCaller, SimulatedCaller};
use crate::health::HealthAggregator;
use crate::observer::{CompositeMeshObserver, MeshObserver};
use crate::registry::ServiceRegistry;
use crate::tracer::Tracer;
use crate::worker::{
    BackgroundWorker, HeartbeatSweeper, MetricsSnapshotter, SnapshotTask, StatusFn, SweepReport,
    SweepTask,
};

/// Services registered by [`ServiceMesh::seed_defaults`], with their ports.
pub const DEFAULT_SERVICES: [(&str, u16); 6] = [
    ("finance", 3001),
    ("hr", 3002),
    ("logistics", 3003),
    ("compliance", 3004),
    ("ai", 3005),
    ("notifications", 3006),
];

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ServiceMeshBuilder {
    config: MeshConfig,
    clock: Option<Arc<dyn ClockSource>>,
    caller: Option<Arc<dyn ServiceCaller>>,
    observers: Vec<Arc<dyn MeshObserver>>,
}

impl ServiceMeshBuilder {
    #[must_use]
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the default [`SimulatedCaller`].
    #[must_use]
    pub fn caller(mut self, caller: Arc<dyn ServiceCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Adds an observer; may be called repeatedly.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[must_use]
    pub fn build(self) -> ServiceMesh {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let caller = self
            .caller
            .unwrap_or_else(|| Arc::new(SimulatedCaller::new(Arc::clone(&clock))));
        let observer: Arc<dyn MeshObserver> = Arc::new(CompositeMeshObserver::new(self.observers));

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker,
            Arc::clone(&clock),
            Arc::clone(&observer),
        ));
        let registry = Arc::new(ServiceRegistry::new(
            Arc::clone(&breakers),
            Arc::clone(&clock),
            Arc::clone(&observer),
            config.heartbeat_stale_multiplier,
        ));
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            config.load_balancer.clone(),
        ));
        let routes = Arc::new(RouteTable::new());
        let tracer = Arc::new(Tracer::new(Arc::clone(&clock), config.max_traces));
        let events = EventBus::new(
            Arc::clone(&clock),
            config.event_history_capacity,
            config.dead_letter_capacity,
        );
        let health = HealthAggregator::new(Arc::clone(&registry), Arc::clone(&clock));

        let shutdown = CancellationToken::new();
        let gateway = Arc::new(Gateway::new(
            GatewayContext {
                routes: Arc::clone(&routes),
                registry: Arc::clone(&registry),
                balancer: Arc::clone(&balancer),
                breakers: Arc::clone(&breakers),
                tracer: Arc::clone(&tracer),
                clock,
            },
            caller,
            config.node_id.clone(),
            shutdown.clone(),
        ));

        ServiceMesh {
            parts: Parts {
                registry,
                breakers,
                balancer,
                routes,
                tracer,
                events,
            },
            config,
            observer,
            health,
            gateway,
            shutdown,
            workers: Mutex::new(Workers::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceMesh
// ---------------------------------------------------------------------------

/// Components the status snapshot reads. Cloned into the snapshot worker.
#[derive(Clone)]
struct Parts {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    routes: Arc<RouteTable>,
    tracer: Arc<Tracer>,
    events: EventBus,
}

impl Parts {
    fn status(&self) -> MeshStatus {
        MeshStatus {
            services: self.registry.service_count(),
            instances: self.registry.instance_count(),
            healthy_instances: self.registry.healthy_count(),
            routes: self.routes.len(),
            circuit_breakers: self.breakers.counts(),
            load_balancer: self.balancer.config(),
            active_traces: self.tracer.trace_count(),
            event_history_size: self.events.history_len(),
            dead_letter_size: self.events.dead_letter_len(),
        }
    }
}

#[derive(Default)]
struct Workers {
    sweep: Option<BackgroundWorker<HeartbeatSweeper>>,
    snapshot: Option<BackgroundWorker<MetricsSnapshotter>>,
}

/// The in-memory service mesh.
pub struct ServiceMesh {
    parts: Parts,
    config: MeshConfig,
    observer: Arc<dyn MeshObserver>,
    health: HealthAggregator,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
    workers: Mutex<Workers>,
}

impl ServiceMesh {
    #[must_use]
    pub fn builder() -> ServiceMeshBuilder {
        ServiceMeshBuilder::default()
    }

    /// A mesh with the given config, the system clock and the simulated caller.
    #[must_use]
    pub fn new(config: MeshConfig) -> Self {
        Self::builder().config(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    // -- component handles --------------------------------------------------

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.parts.registry
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.parts.breakers
    }

    #[must_use]
    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.parts.balancer
    }

    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.parts.routes
    }

    #[must_use]
    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.parts.tracer
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.parts.events
    }

    #[must_use]
    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// The gateway wrapped in load shedding and metrics layers.
    #[must_use]
    pub fn gateway_service(&self) -> GatewayPipeline {
        build_gateway_pipeline(GatewayService::new(Arc::clone(&self.gateway)), &self.config)
    }

    // -- registry -----------------------------------------------------------

    pub fn register(&self, registration: InstanceRegistration) -> ServiceInstance {
        self.parts.registry.register(registration)
    }

    pub fn deregister(&self, service: &str, instance_id: &str) -> bool {
        self.parts.registry.deregister(service, instance_id)
    }

    pub fn heartbeat(&self, service: &str, instance_id: &str) -> bool {
        self.parts.registry.heartbeat(service, instance_id)
    }

    pub fn set_status(&self, service: &str, instance_id: &str, status: InstanceStatus) -> bool {
        self.parts.registry.set_status(service, instance_id, status)
    }

    #[must_use]
    pub fn instances(&self, service: &str) -> Option<Vec<ServiceInstance>> {
        self.parts.registry.instances(service)
    }

    #[must_use]
    pub fn healthy_instances(&self, service: &str) -> Vec<ServiceInstance> {
        self.parts.registry.healthy(service)
    }

    // -- routing ------------------------------------------------------------

    /// # Errors
    ///
    /// [`MeshError::InvalidRoutePattern`] if the path pattern is malformed.
    pub fn register_route(&self, route: ServiceRoute) -> Result<(), MeshError> {
        self.parts.routes.register(route)
    }

    pub fn remove_route(&self, method: RouteMethod, path: &str) -> bool {
        self.parts.routes.remove(method, path)
    }

    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        self.gateway.handle(request).await
    }

    // -- load balancer ------------------------------------------------------

    #[must_use]
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.parts.balancer.strategy()
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        self.parts.balancer.set_strategy(strategy);
    }

    #[must_use]
    pub fn select_instance(&self, service: &str, client_ip: Option<&str>) -> Option<ServiceInstance> {
        self.parts.balancer.select(service, client_ip)
    }

    // -- circuit breakers ---------------------------------------------------

    #[must_use]
    pub fn breaker_state(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        self.parts.breakers.state(service)
    }

    #[must_use]
    pub fn breaker_states(&self) -> Vec<CircuitBreakerSnapshot> {
        self.parts.breakers.all_states()
    }

    pub fn reset_breaker(&self, service: &str) -> bool {
        self.parts.breakers.reset(service)
    }

    pub fn configure_breaker(&self, service: &str, patch: &CircuitBreakerConfigPatch) -> bool {
        self.parts.breakers.configure(service, patch)
    }

    // -- events -------------------------------------------------------------

    pub async fn publish(&self, event: NewEvent) -> String {
        self.parts.events.publish(event).await
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        self.parts.events.subscribe(topic, handler)
    }

    #[must_use]
    pub fn event_history(&self, event_type: Option<&str>, limit: usize) -> Vec<EventMessage> {
        self.parts.events.history(event_type, limit)
    }

    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.parts.events.dead_letters()
    }

    pub async fn retry_dead_letter(&self, event_id: &str) -> Option<String> {
        self.parts.events.retry(event_id).await
    }

    pub fn clear_dead_letters(&self) -> usize {
        self.parts.events.clear_dead_letters()
    }

    // -- health and status --------------------------------------------------

    #[must_use]
    pub fn check_instance(&self, service: &str, instance_id: &str) -> ServiceHealthReport {
        self.health.check_instance(service, instance_id)
    }

    #[must_use]
    pub fn check_all(&self) -> Vec<ServiceHealthReport> {
        self.health.check_all()
    }

    #[must_use]
    pub fn status(&self) -> MeshStatus {
        self.parts.status()
    }

    // -- descriptors --------------------------------------------------------

    /// # Errors
    ///
    /// [`MeshError::UnknownService`] if `service` has no instances.
    pub fn kubernetes_manifest(&self, service: &str) -> Result<String, MeshError> {
        descriptor::kubernetes_manifest(&self.parts.registry, &self.config.image_registry, service)
    }

    /// # Errors
    ///
    /// [`MeshError::UnknownService`] if `service` has no instances.
    pub fn compose_service(&self, service: &str) -> Result<String, MeshError> {
        descriptor::compose_service(&self.parts.registry, &self.config.image_registry, service)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Registers one healthy instance of each default platform service and an
    /// `ALL /api/<name>/*` route to it.
    ///
    /// # Errors
    ///
    /// Propagates route registration errors.
    pub fn seed_defaults(&self) -> Result<(), MeshError> {
        for (name, port) in DEFAULT_SERVICES {
            let mut registration =
                InstanceRegistration::new(name, format!("{name}-instance-1"), "localhost", port);
            registration.metadata = InstanceMetadata {
                region: Some("eu-west".to_string()),
                zone: Some("romania".to_string()),
                environment: Some("development".to_string()),
                weight: Some(1),
                tags: vec!["core".to_string()],
                capabilities: Vec::new(),
            };
            self.parts.registry.register(registration);

            let route = ServiceRoute::new(RouteMethod::All, format!("/api/{name}/*"), name)
                .with_authentication(true);
            self.parts.routes.register(route)?;
        }
        info!(services = DEFAULT_SERVICES.len(), "default services seeded");
        Ok(())
    }

    /// Starts the heartbeat sweep and metrics snapshot workers. Calling it
    /// again while they run is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_background(&self) {
        let mut workers = self.workers.lock();
        if workers.sweep.is_none() {
            workers.sweep = Some(BackgroundWorker::start(
                HeartbeatSweeper::new(Arc::clone(&self.parts.registry)),
                self.config.load_balancer.health_check_interval_ms,
            ));
        }
        if workers.snapshot.is_none() {
            let parts = self.parts.clone();
            let status: StatusFn = Arc::new(move || parts.status());
            workers.snapshot = Some(BackgroundWorker::start(
                MetricsSnapshotter::new(status, Arc::clone(&self.observer)),
                self.config.metrics_interval_ms,
            ));
        }
        info!(node_id = %self.config.node_id, "background workers started");
    }

    /// Runs the heartbeat sweep now on the sweep worker instead of waiting
    /// for its next tick. Returns the instances it marked unhealthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the background workers are not running.
    pub async fn sweep_now(&self) -> anyhow::Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        {
            let workers = self.workers.lock();
            let worker = workers
                .sweep
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("background workers not started"))?;
            worker.submit(SweepTask::RunNow(tx))?;
        }
        Ok(rx.await?)
    }

    /// Publishes a metrics snapshot now and returns the status it carried.
    ///
    /// # Errors
    ///
    /// Returns an error if the background workers are not running.
    pub async fn snapshot_now(&self) -> anyhow::Result<MeshStatus> {
        let (tx, rx) = oneshot::channel();
        {
            let workers = self.workers.lock();
            let worker = workers
                .snapshot
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("background workers not started"))?;
            worker.submit(SnapshotTask::EmitNow(tx))?;
        }
        Ok(rx.await?)
    }

    /// Token cancelled when the mesh shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels in-flight dispatches, stops pending breaker timers and waits
    /// for the background workers to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.parts.breakers.shutdown();

        let (sweep, snapshot) = {
            let mut workers = self.workers.lock();
            (workers.sweep.take(), workers.snapshot.take())
        };
        if let Some(mut worker) = sweep {
            worker.stop().await;
        }
        if let Some(mut worker) = snapshot {
            worker.stop().await;
        }
        info!(node_id = %self.config.node_id, "mesh shut down");
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for ServiceMesh {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            let workers = self.workers.get_mut();
            if workers.sweep.is_some() || workers.snapshot.is_some() {
                warn!("mesh dropped without shutdown; background workers detached");
            }
        }
        self.parts.breakers.shutdown();
    }
}
