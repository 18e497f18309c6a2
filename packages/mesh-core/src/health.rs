//! Derived health report types.

use serde::{Deserialize, Serialize};

/// Outcome of a single named check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    /// Grades `value` against two ascending thresholds: below `pass_below`
    /// passes, below `warn_below` warns, anything else fails.
    #[must_use]
    pub fn grade(value: f64, pass_below: f64, warn_below: f64) -> Self {
        if value < pass_below {
            Self::Pass
        } else if value < warn_below {
            Self::Warn
        } else {
            Self::Fail
        }
    }
}

/// Overall verdict for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Any failing check makes the instance unhealthy, any warning degraded.
    #[must_use]
    pub fn from_checks(checks: &[HealthCheckResult]) -> Self {
        if checks.iter().any(|c| c.status == CheckStatus::Fail) {
            Self::Unhealthy
        } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

/// One named check inside a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Point-in-time verdict for one instance. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthReport {
    pub service_name: String,
    pub instance_id: String,
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    /// Milliseconds since registration.
    pub uptime_ms: u64,
    pub timestamp: u64,
}
