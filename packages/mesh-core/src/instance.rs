//! Service instance data model.
//!
//! A [`ServiceInstance`] is one running copy of a logical service. Instances
//! are keyed by `(name, id)`; the registry owns their lifecycle.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Wire protocol spoken by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Grpc,
}

/// Lifecycle status of an instance. Only `Healthy` instances receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

impl InstanceStatus {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
        }
    }
}

// ---------------------------------------------------------------------------
// Nested structs
// ---------------------------------------------------------------------------

/// Placement and routing hints attached to an instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    pub region: Option<String>,
    pub zone: Option<String>,
    pub environment: Option<String>,
    /// Relative weight for the weighted strategy. Missing or zero counts as 1.
    pub weight: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl InstanceMetadata {
    /// Weight used by the weighted strategy.
    #[must_use]
    pub fn effective_weight(&self) -> u32 {
        match self.weight {
            Some(w) if w > 0 => w,
            _ => 1,
        }
    }
}

/// Heartbeat contract and the running counters the sweep maintains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckDescriptor {
    pub endpoint: String,
    /// Expected interval between heartbeats (ms).
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Last time the staleness sweep looked at this instance (ms since epoch).
    pub last_check: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl Default for HealthCheckDescriptor {
    fn default() -> Self {
        Self {
            endpoint: "/health".to_string(),
            interval_ms: 10_000,
            timeout_ms: 5_000,
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Running request metrics for one instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    /// Approximated as the maximum observed latency.
    pub p99_response_time_ms: f64,
}

impl InstanceMetrics {
    /// Folds one successful call into the running averages.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_success(&mut self, latency_ms: f64) {
        self.request_count += 1;
        let n = self.request_count as f64;
        self.avg_response_time_ms = (self.avg_response_time_ms * (n - 1.0) + latency_ms) / n;
        self.p99_response_time_ms = self.p99_response_time_ms.max(latency_ms);
    }

    /// Counts one failed call.
    pub fn record_failure(&mut self) {
        self.request_count += 1;
        self.error_count += 1;
    }

    /// `error_count / request_count`, or 0 when nothing was served yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceInstance
// ---------------------------------------------------------------------------

/// One registered copy of a logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub status: InstanceStatus,
    pub metadata: InstanceMetadata,
    pub health_check: HealthCheckDescriptor,
    /// Registration time (ms since epoch).
    pub registered_at: u64,
    /// Last heartbeat or status update (ms since epoch).
    pub last_heartbeat: u64,
    pub metrics: InstanceMetrics,
}

impl ServiceInstance {
    /// Builds a live instance from a registration request.
    #[must_use]
    pub fn from_registration(reg: InstanceRegistration, now_ms: u64) -> Self {
        Self {
            id: reg.id,
            name: reg.name,
            version: reg.version,
            host: reg.host,
            port: reg.port,
            protocol: reg.protocol,
            status: reg.status,
            metadata: reg.metadata,
            health_check: reg.health_check,
            registered_at: now_ms,
            last_heartbeat: now_ms,
            metrics: InstanceMetrics::default(),
        }
    }

    /// `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }

    /// Milliseconds since the last heartbeat as of `now_ms`.
    #[must_use]
    pub fn heartbeat_age(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_heartbeat)
    }
}

// ---------------------------------------------------------------------------
// InstanceRegistration
// ---------------------------------------------------------------------------

/// Caller-supplied part of a [`ServiceInstance`]; the registry stamps the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRegistration {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: InstanceMetadata,
    #[serde(default)]
    pub health_check: HealthCheckDescriptor,
}

impl InstanceRegistration {
    /// Healthy HTTP instance `id` of service `name` at `host:port`, version `1.0.0`.
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1.0.0".to_string(),
            host: host.into(),
            port,
            protocol: Protocol::Http,
            status: InstanceStatus::Healthy,
            metadata: InstanceMetadata::default(),
            health_check: HealthCheckDescriptor::default(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.metadata.weight = Some(weight);
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.metadata.region = Some(region.into());
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.health_check.interval_ms = interval_ms;
        self
    }
}
