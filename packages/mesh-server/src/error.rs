//! Configuration errors raised synchronously by the mesh.
//!
//! Runtime conditions (unknown ids, unavailable services, handler failures)
//! are never errors here: they surface as `Option`/`bool`, 503/500 gateway
//! responses, or dead-letter entries.

/// Programming or configuration mistakes.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidRoutePattern { pattern: String, reason: String },
    #[error("service {name} not found")]
    UnknownService { name: String },
    #[error("failed to render descriptor: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl MeshError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRoutePattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}
