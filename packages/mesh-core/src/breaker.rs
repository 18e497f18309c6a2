//! Circuit breaker state and configuration types.

use serde::{Deserialize, Serialize};

/// Three-state breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Thresholds governing breaker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failures that trip a closed breaker open.
    pub failure_threshold: u32,
    /// Successes in half-open that close the breaker again.
    pub success_threshold: u32,
    /// How long the breaker stays open before probing (ms).
    pub timeout_ms: u64,
    /// Maximum concurrent probe calls admitted while half-open.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_ms: 30_000,
            half_open_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Overlays the fields present in `patch` without touching the rest.
    pub fn merge(&mut self, patch: &CircuitBreakerConfigPatch) {
        if let Some(v) = patch.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = patch.success_threshold {
            self.success_threshold = v;
        }
        if let Some(v) = patch.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = patch.half_open_requests {
            self.half_open_requests = v;
        }
    }
}

/// Partial breaker config used by `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfigPatch {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub half_open_requests: Option<u32>,
}

/// Point-in-time view of one service's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<u64>,
    pub last_success: Option<u64>,
    pub opened_at: Option<u64>,
    pub half_open_at: Option<u64>,
    pub config: CircuitBreakerConfig,
}

impl CircuitBreakerSnapshot {
    /// Fresh closed breaker for `service_name`.
    #[must_use]
    pub fn closed(service_name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            service_name: service_name.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_success: None,
            opened_at: None,
            half_open_at: None,
            config,
        }
    }
}
