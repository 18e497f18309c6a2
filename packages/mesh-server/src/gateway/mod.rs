//! API gateway: resolves a request to a route, guards it with the service's
//! circuit breaker, picks an instance and dispatches through a
//! [`ServiceCaller`].
//!
//! - [`routes`]: pattern compilation and the route table
//! - [`caller`]: the dispatch seam and the simulated caller
//! - [`service`]: `tower::Service` adapter
//! - [`middleware`]: load shedding and metrics layers

pub mod caller;
pub mod middleware;
pub mod routes;
pub mod service;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use meshkit_core::{
    ClockSource, GatewayRequest, GatewayResponse, LogLevel, ServiceInstance, SpanStatus,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::breaker::{Admission, BreakerPermit, CircuitBreakerRegistry};
use crate::registry::ServiceRegistry;
use crate::tracer::Tracer;

pub use caller::{CallResponse, ServiceCall, ServiceCaller, SimulatedCaller};
pub use routes::{RouteMatch, RouteTable};

/// Service name stamped on gateway spans and on responses the gateway
/// answers itself.
pub const GATEWAY_SERVICE: &str = "gateway";
/// Request header carrying the caller's span id; the gateway span joins that
/// span's trace.
pub const PARENT_SPAN_HEADER: &str = "x-parent-span-id";

/// Components the gateway reads and updates on every call.
#[derive(Clone)]
pub struct GatewayContext {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<ServiceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub tracer: Arc<Tracer>,
    pub clock: Arc<dyn ClockSource>,
}

pub struct Gateway {
    ctx: GatewayContext,
    caller: Arc<dyn ServiceCaller>,
    node_id: String,
    /// Parent of every dispatch's cancellation token.
    shutdown: CancellationToken,
}

impl Gateway {
    #[must_use]
    pub fn new(
        ctx: GatewayContext,
        caller: Arc<dyn ServiceCaller>,
        node_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            caller,
            node_id: node_id.into(),
            shutdown,
        }
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.ctx.routes
    }

    /// Handles one request end to end. Never fails: every outcome is a
    /// response (200 from the service, 404, 503 or 500).
    pub async fn handle(&self, mut request: GatewayRequest) -> GatewayResponse {
        let started = self.ctx.clock.now();
        if request.id.is_empty() {
            request.id = Uuid::new_v4().to_string();
        }
        if request.timestamp == 0 {
            request.timestamp = started;
        }

        let Some(matched) = self.ctx.routes.resolve(&request.method, &request.path) else {
            debug!(method = %request.method, path = %request.path, "no route");
            return self.respond(
                started,
                404,
                BTreeMap::new(),
                json!({ "error": "Route not found", "path": request.path }),
                GATEWAY_SERVICE,
                &self.node_id,
            );
        };
        let service = matched.route.service_name.clone();
        let guarded = matched.route.circuit_breaker;

        let mut permit = if guarded {
            match self.ctx.breakers.try_acquire(&service) {
                Admission::Allowed(permit) => Some(permit),
                Admission::Rejected(state) => {
                    debug!(service = %service, state = state.as_str(), "short-circuited");
                    return self.respond(
                        started,
                        503,
                        BTreeMap::new(),
                        json!({
                            "error": "Service unavailable",
                            "service": service,
                            "circuit": state.as_str(),
                        }),
                        &service,
                        "unknown",
                    );
                }
            }
        } else {
            None
        };

        let client_ip = Some(request.client_ip.as_str()).filter(|ip| !ip.is_empty());
        let Some(mut instance) = self.ctx.balancer.select(&service, client_ip) else {
            return self.respond(
                started,
                503,
                BTreeMap::new(),
                json!({ "error": "No healthy instances available", "service": service }),
                &service,
                "unknown",
            );
        };

        let tracer = &self.ctx.tracer;
        let parent = request.headers.get(PARENT_SPAN_HEADER).map(String::as_str);
        let operation = format!("{} {}", request.method, request.path);
        let span = tracer.start_trace(&operation, GATEWAY_SERVICE, parent);
        let (trace_id, span_id) = (span.trace_id, span.span_id);
        tracer.tag_span(&span_id, "service", &service);
        tracer.tag_span(&span_id, "route", &matched.route.key());
        tracer.tag_span(&span_id, "request.id", &request.id);

        let mut attempt = 0;
        loop {
            tracer.tag_span(&span_id, "instance", &instance.id);
            let attempt_started = self.ctx.clock.now();

            let error = match self.dispatch(&instance, &matched, &request, &trace_id).await {
                Ok(reply) => {
                    #[allow(clippy::cast_precision_loss)]
                    let latency = self.ctx.clock.now().saturating_sub(attempt_started) as f64;
                    self.ctx.registry.record_success(&service, &instance.id, latency);
                    if guarded {
                        self.ctx.breakers.record_success(&service);
                    }
                    drop(permit);
                    tracer.end_span(&span_id, SpanStatus::Completed);

                    let mut headers = reply.headers;
                    headers.insert("x-service-name".to_string(), service.clone());
                    headers.insert("x-instance-id".to_string(), instance.id.clone());
                    headers.insert("x-trace-id".to_string(), trace_id.clone());
                    return self.respond(
                        started,
                        reply.status_code,
                        headers,
                        reply.body,
                        &service,
                        &instance.id,
                    );
                }
                Err(error) => error,
            };

            let message = format!("{error:#}");
            self.ctx.registry.record_failure(&service, &instance.id);
            if guarded {
                self.ctx.breakers.record_failure(&service);
            }
            tracer.log_span(
                &span_id,
                LogLevel::Error,
                &format!("{} failed: {message}", instance.id),
            );
            warn!(
                service = %service,
                instance_id = %instance.id,
                attempt,
                error = %message,
                "service call failed"
            );

            let retries = matched.route.retries;
            if let Some(next) =
                self.next_attempt(&service, client_ip, guarded, attempt, retries, &mut permit)
            {
                instance = next;
                attempt += 1;
                continue;
            }

            tracer.end_span(&span_id, SpanStatus::Failed);
            let headers = BTreeMap::from([("x-trace-id".to_string(), trace_id.clone())]);
            return self.respond(
                started,
                500,
                headers,
                json!({ "error": "Internal service error", "message": message }),
                &service,
                &instance.id,
            );
        }
    }

    /// Picks the instance for a retry, or `None` when retries are spent, the
    /// breaker no longer admits calls, or no healthy instance is left.
    fn next_attempt(
        &self,
        service: &str,
        client_ip: Option<&str>,
        guarded: bool,
        attempt: u32,
        retries: u32,
        permit: &mut Option<BreakerPermit>,
    ) -> Option<ServiceInstance> {
        if attempt >= retries {
            return None;
        }
        if guarded {
            *permit = None;
            match self.ctx.breakers.try_acquire(service) {
                Admission::Allowed(next) => *permit = Some(next),
                Admission::Rejected(_) => return None,
            }
        }
        self.ctx.balancer.select(service, client_ip)
    }

    async fn dispatch(
        &self,
        instance: &ServiceInstance,
        matched: &RouteMatch,
        request: &GatewayRequest,
        trace_id: &str,
    ) -> anyhow::Result<CallResponse> {
        let call = ServiceCall {
            instance: instance.clone(),
            route: matched.route.clone(),
            request: request.clone(),
            forward_path: matched.forward_path.clone(),
            params: matched.params.clone(),
            trace_id: trace_id.to_string(),
        };
        let cancel = self.shutdown.child_token();
        let _connection = self
            .ctx
            .registry
            .track_connection(&instance.name, &instance.id);

        let call_fut = AssertUnwindSafe(self.caller.call(&call, cancel.clone())).catch_unwind();
        let outcome = match matched.route.timeout_ms {
            Some(ms) => {
                if let Ok(outcome) = tokio::time::timeout(Duration::from_millis(ms), call_fut).await {
                    outcome
                } else {
                    cancel.cancel();
                    anyhow::bail!("request timed out after {ms}ms");
                }
            }
            None => call_fut.await,
        };
        outcome.unwrap_or_else(|_| Err(anyhow::anyhow!("service call panicked")))
    }

    fn respond(
        &self,
        started: u64,
        status_code: u16,
        headers: BTreeMap<String, String>,
        body: Value,
        service_name: &str,
        instance_id: &str,
    ) -> GatewayResponse {
        let duration_ms = self.ctx.clock.now().saturating_sub(started);
        metrics::counter!(
            "meshkit_gateway_requests_total",
            "service" => service_name.to_string(),
            "status" => status_code.to_string()
        )
        .increment(1);
        #[allow(clippy::cast_precision_loss)]
        let duration = duration_ms as f64;
        metrics::histogram!("meshkit_gateway_duration_ms").record(duration);

        GatewayResponse {
            status_code,
            headers,
            body,
            duration_ms,
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use meshkit_core::{
        CircuitBreakerConfig, CircuitState, InstanceRegistration, InstanceStatus,
        LoadBalancerConfig, ManualClock, RouteMethod, ServiceRoute,
    };

    use super::*;
    use crate::observer::CompositeMeshObserver;

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceCaller for Flaky {
        async fn call(&self, call: &ServiceCall, _cancel: CancellationToken) -> anyhow::Result<CallResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("{} is down", call.instance.id);
            }
            Ok(CallResponse {
                status_code: 200,
                headers: BTreeMap::new(),
                body: json!({ "ok": true, "path": call.forward_path }),
            })
        }
    }

    /// Never answers until cancelled.
    struct Hangs;

    #[async_trait]
    impl ServiceCaller for Hangs {
        async fn call(&self, _call: &ServiceCall, cancel: CancellationToken) -> anyhow::Result<CallResponse> {
            cancel.cancelled().await;
            anyhow::bail!("cancelled")
        }
    }

    struct Panics;

    #[async_trait]
    impl ServiceCaller for Panics {
        async fn call(&self, _call: &ServiceCall, _cancel: CancellationToken) -> anyhow::Result<CallResponse> {
            panic!("caller bug")
        }
    }

    fn gateway(caller: Arc<dyn ServiceCaller>) -> Gateway {
        let clock = Arc::new(ManualClock::new(1_000));
        let observer = Arc::new(CompositeMeshObserver::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
            clock.clone(),
            observer.clone(),
        ));
        let registry = Arc::new(ServiceRegistry::new(
            breakers.clone(),
            clock.clone(),
            observer,
            3,
        ));
        let ctx = GatewayContext {
            routes: Arc::new(RouteTable::new()),
            balancer: Arc::new(LoadBalancer::new(
                registry.clone(),
                LoadBalancerConfig::default(),
            )),
            registry,
            breakers,
            tracer: Arc::new(Tracer::new(clock.clone(), 100)),
            clock,
        };
        Gateway::new(ctx, caller, "gw-1", CancellationToken::new())
    }

    fn simulated() -> Gateway {
        gateway(Arc::new(SimulatedCaller::new(Arc::new(ManualClock::new(0)))))
    }

    fn billing(gw: &Gateway, instances: usize) {
        for i in 0..instances {
            gw.ctx.registry.register(InstanceRegistration::new(
                "billing",
                format!("b-{i}"),
                "localhost",
                9000,
            ));
        }
        gw.routes()
            .register(ServiceRoute::new(RouteMethod::All, "/api/billing/*", "billing"))
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let gw = simulated();
        let resp = gw.handle(GatewayRequest::new("GET", "/nowhere")).await;
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.service_name, GATEWAY_SERVICE);
        assert_eq!(resp.instance_id, "gw-1");
        assert_eq!(resp.body["path"], "/nowhere");
    }

    #[tokio::test]
    async fn no_healthy_instance_is_503() {
        let gw = simulated();
        billing(&gw, 1);
        gw.ctx
            .registry
            .set_status("billing", "b-0", InstanceStatus::Unhealthy);
        let resp = gw.handle(GatewayRequest::new("GET", "/api/billing/x")).await;
        assert_eq!(resp.status_code, 503);
        assert_eq!(resp.instance_id, "unknown");
        assert_eq!(gw.ctx.tracer.trace_count(), 0);
    }

    #[tokio::test]
    async fn success_populates_response_and_trace() {
        let gw = simulated();
        billing(&gw, 2);
        let resp = gw
            .handle(GatewayRequest::new("GET", "/api/billing/invoices"))
            .await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.service_name, "billing");
        assert_eq!(resp.instance_id, "b-0");
        assert_eq!(resp.headers["x-service-name"], "billing");

        let trace = gw.ctx.tracer.get_trace(&resp.headers["x-trace-id"]).unwrap();
        assert_eq!(trace.operation_name, "GET /api/billing/invoices");
        assert_eq!(trace.status, SpanStatus::Completed);
        assert_eq!(trace.tags["instance"], "b-0");

        let metrics = gw.ctx.registry.instance("billing", "b-0").unwrap().metrics;
        assert_eq!(metrics.request_count, 1);
        assert_eq!(gw.ctx.registry.active_connections("billing", "b-0"), 0);
    }

    #[tokio::test]
    async fn failures_open_breaker_then_short_circuit() {
        let flaky = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let gw = gateway(flaky.clone());
        billing(&gw, 1);

        for _ in 0..2 {
            let resp = gw.handle(GatewayRequest::new("POST", "/api/billing/pay")).await;
            assert_eq!(resp.status_code, 500);
            assert_eq!(resp.body["message"], "b-0 is down");
        }
        assert_eq!(
            gw.ctx.breakers.state("billing").unwrap().state,
            CircuitState::Open
        );

        let resp = gw.handle(GatewayRequest::new("POST", "/api/billing/pay")).await;
        assert_eq!(resp.status_code, 503);
        assert_eq!(resp.body["circuit"], "open");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let errors = gw.ctx.registry.instance("billing", "b-0").unwrap().metrics;
        assert_eq!(errors.error_count, 2);
    }

    #[tokio::test]
    async fn breaker_bypass_skips_breaker() {
        let flaky = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let gw = gateway(flaky.clone());
        gw.ctx
            .registry
            .register(InstanceRegistration::new("billing", "b-0", "localhost", 9000));
        gw.routes()
            .register(
                ServiceRoute::new(RouteMethod::Get, "/unguarded", "billing").with_circuit_breaker(false),
            )
            .unwrap();

        for _ in 0..5 {
            let resp = gw.handle(GatewayRequest::new("GET", "/unguarded")).await;
            assert_eq!(resp.status_code, 500);
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 5);
        assert_eq!(gw.ctx.breakers.state("billing").unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn retries_move_to_next_instance() {
        let flaky = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let gw = gateway(flaky);
        for i in 0..2 {
            gw.ctx.registry.register(InstanceRegistration::new(
                "billing",
                format!("b-{i}"),
                "localhost",
                9000,
            ));
        }
        gw.routes()
            .register(ServiceRoute::new(RouteMethod::Get, "/pay", "billing").with_retries(1))
            .unwrap();

        let resp = gw.handle(GatewayRequest::new("GET", "/pay")).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.instance_id, "b-1");
        assert_eq!(
            gw.ctx
                .registry
                .instance("billing", "b-0")
                .unwrap()
                .metrics
                .error_count,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn route_timeout_cancels_and_fails() {
        let gw = gateway(Arc::new(Hangs));
        gw.ctx
            .registry
            .register(InstanceRegistration::new("billing", "b-0", "localhost", 9000));
        gw.routes()
            .register(ServiceRoute::new(RouteMethod::Get, "/slow", "billing").with_timeout_ms(50))
            .unwrap();

        let resp = gw.handle(GatewayRequest::new("GET", "/slow")).await;
        assert_eq!(resp.status_code, 500);
        assert_eq!(resp.body["message"], "request timed out after 50ms");
        assert_eq!(gw.ctx.breakers.state("billing").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn panicking_caller_is_500() {
        let gw = gateway(Arc::new(Panics));
        billing(&gw, 1);
        let resp = gw.handle(GatewayRequest::new("GET", "/api/billing/x")).await;
        assert_eq!(resp.status_code, 500);
        assert_eq!(resp.body["message"], "service call panicked");
        assert_eq!(gw.ctx.registry.active_connections("billing", "b-0"), 0);
    }

    #[tokio::test]
    async fn strip_prefix_forwards_suffix() {
        let gw = gateway(Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        }));
        gw.ctx
            .registry
            .register(InstanceRegistration::new("billing", "b-0", "localhost", 9000));
        gw.routes()
            .register(
                ServiceRoute::new(RouteMethod::All, "/api/billing/*", "billing").with_strip_prefix(true),
            )
            .unwrap();
        let resp = gw
            .handle(GatewayRequest::new("GET", "/api/billing/invoices/3"))
            .await;
        assert_eq!(resp.body["path"], "/invoices/3");
    }

    #[tokio::test]
    async fn parent_span_header_joins_trace() {
        let gw = simulated();
        billing(&gw, 1);
        let upstream = gw.ctx.tracer.start_trace("checkout", "orders", None);
        let resp = gw
            .handle(
                GatewayRequest::new("GET", "/api/billing/x")
                    .with_header(PARENT_SPAN_HEADER, upstream.span_id.clone()),
            )
            .await;
        assert_eq!(resp.headers["x-trace-id"], upstream.trace_id);
        // The upstream root stays open; only the gateway span ended.
        assert!(gw.ctx.tracer.get_trace(&upstream.trace_id).unwrap().is_open());
        assert_eq!(gw.ctx.tracer.trace_spans(&upstream.trace_id).len(), 2);
    }
}
