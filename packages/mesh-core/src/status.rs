//! Aggregate mesh status.

use serde::{Deserialize, Serialize};

use crate::balancer::LoadBalancerConfig;

/// Breaker counts by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerCounts {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Snapshot of everything the mesh is holding, for operators and the
/// periodic metrics tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    pub services: usize,
    pub instances: usize,
    pub healthy_instances: usize,
    pub routes: usize,
    pub circuit_breakers: BreakerCounts,
    pub load_balancer: LoadBalancerConfig,
    pub active_traces: usize,
    pub event_history_size: usize,
    pub dead_letter_size: usize,
}
