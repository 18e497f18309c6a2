//! `meshkit` core — service, route, breaker, trace, event and health data model.
//!
//! Plain serde types shared by the mesh runtime and by collaborating
//! modules that register with it, route through it, or subscribe to it.

pub mod balancer;
pub mod breaker;
pub mod clock;
pub mod event;
pub mod gateway;
pub mod hash;
pub mod health;
pub mod instance;
pub mod route;
pub mod status;
pub mod trace;

pub use balancer::{LoadBalancerConfig, LoadBalancingStrategy, StickySessionPolicy};
pub use breaker::{
    CircuitBreakerConfig, CircuitBreakerConfigPatch, CircuitBreakerSnapshot, CircuitState,
};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use event::{DeadLetter, DeliveryFailure, EventMessage, EventMetadata, EventRouting, NewEvent};
pub use gateway::{GatewayRequest, GatewayResponse};
pub use health::{CheckStatus, HealthCheckResult, HealthStatus, ServiceHealthReport};
pub use instance::{
    HealthCheckDescriptor, InstanceMetadata, InstanceMetrics, InstanceRegistration,
    InstanceStatus, Protocol, ServiceInstance,
};
pub use route::{route_key, CachePolicy, RateLimitHint, RouteMethod, ServiceRoute};
pub use status::{BreakerCounts, MeshStatus};
pub use trace::{LogEntry, LogLevel, Span, SpanStatus};
