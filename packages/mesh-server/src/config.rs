use std::time::Duration;

use meshkit_core::{CircuitBreakerConfig, LoadBalancerConfig};

/// Mesh-wide configuration.
///
/// Controls breaker defaults, load balancing, retention limits and the
/// intervals of the background sweep and metrics workers.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Identifier of this mesh node, stamped on deployment descriptors and logs.
    pub node_id: String,
    /// Breaker config given to every newly seen service.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Initial load balancer settings. The sweep interval comes from here too.
    pub load_balancer: LoadBalancerConfig,
    /// An instance is stale once its heartbeat age exceeds this multiple of its
    /// heartbeat interval.
    pub heartbeat_stale_multiplier: u64,
    /// Events kept in the publish history ring buffer.
    pub event_history_capacity: usize,
    /// Dead letters kept before the oldest is dropped.
    pub dead_letter_capacity: usize,
    /// Traces retained by the tracer before the oldest is evicted.
    pub max_traces: usize,
    /// Interval between metrics snapshots in milliseconds.
    pub metrics_interval_ms: u64,
    /// Maximum number of concurrent gateway calls before load shedding.
    pub max_concurrent_calls: u32,
    /// Image registry prefix used by deployment descriptors.
    pub image_registry: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: "mesh-1".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            heartbeat_stale_multiplier: 3,
            event_history_capacity: 1000,
            dead_letter_capacity: 1000,
            max_traces: 10_000,
            metrics_interval_ms: 60_000,
            max_concurrent_calls: 1000,
            image_registry: "meshkit".to_string(),
        }
    }
}

/// Bind address and HTTP policy of the admin router.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub host: String,
    /// 0 means OS-assigned.
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Maximum time to serve one admin request.
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight admin requests.
    pub drain_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}
