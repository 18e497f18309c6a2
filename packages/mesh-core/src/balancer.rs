//! Load balancer configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Algorithm used to pick one healthy instance per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    Random,
    IpHash,
}

impl LoadBalancingStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::Weighted => "weighted",
            Self::Random => "random",
            Self::IpHash => "ip-hash",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sticky-session cookie policy. Carried for collaborators; the mesh itself
/// only uses ip-hash for affinity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickySessionPolicy {
    pub enabled: bool,
    pub cookie_name: String,
    pub ttl_ms: u64,
}

impl Default for StickySessionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: "SERVERID".to_string(),
            ttl_ms: 3_600_000,
        }
    }
}

/// Process-wide load balancer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    /// Interval of the heartbeat staleness sweep (ms).
    pub health_check_interval_ms: u64,
    pub failover_threshold: u32,
    pub sticky_session: Option<StickySessionPolicy>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_interval_ms: 10_000,
            failover_threshold: 3,
            sticky_session: Some(StickySessionPolicy::default()),
        }
    }
}
