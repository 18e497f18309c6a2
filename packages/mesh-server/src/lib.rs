//! `meshkit` server: an in-memory service mesh.
//!
//! Registry, load balancer, circuit breakers, gateway, distributed tracer,
//! event bus and health aggregation, wired together by [`ServiceMesh`] and
//! exposed over HTTP by the [`admin`] router.

pub mod admin;
pub mod balancer;
pub mod breaker;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event_bus;
pub mod gateway;
pub mod health;
pub mod mesh;
pub mod observer;
pub mod registry;
pub mod telemetry;
pub mod tracer;
pub mod worker;

pub use balancer::LoadBalancer;
pub use breaker::{Admission, BreakerPermit, CircuitBreakerRegistry};
pub use config::{AdminConfig, MeshConfig};
pub use error::MeshError;
pub use event_bus::{EventBus, EventHandler, FnHandler, Subscription, WILDCARD_TOPIC};
pub use gateway::{
    CallResponse, Gateway, GatewayContext, RouteMatch, RouteTable, ServiceCall, ServiceCaller,
    SimulatedCaller,
};
pub use health::HealthAggregator;
pub use mesh::{ServiceMesh, ServiceMeshBuilder};
pub use observer::{CompositeMeshObserver, MeshObserver};
pub use registry::{ConnectionGuard, ServiceRegistry};
pub use tracer::Tracer;
