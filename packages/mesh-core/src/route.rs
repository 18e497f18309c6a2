//! Gateway route definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// HTTP method a route is bound to. `All` matches any method and is only
/// consulted after an exact-method match fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    All,
}

impl RouteMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::All => "ALL",
        }
    }

    /// Whether a route bound to `self` accepts a request made with `method`.
    #[must_use]
    pub fn accepts(self, method: &str) -> bool {
        self == Self::All || self.as_str().eq_ignore_ascii_case(method)
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unsupported method name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown route method: {}", self.0)
    }
}

impl std::error::Error for UnknownMethod {}

impl FromStr for RouteMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "ALL" => Ok(Self::All),
            _ => Err(UnknownMethod(s.to_string())),
        }
    }
}

/// Per-route rate limit hint. Enforcement belongs to the external rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitHint {
    pub requests: u32,
    pub window_ms: u64,
}

/// Response caching policy carried with a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub key: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A `(method, path pattern)` pair bound to a target service.
///
/// Patterns are literal paths, optionally containing `:name` segments
/// (one path segment) and a trailing `*` (any remaining suffix).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoute {
    pub path: String,
    pub method: RouteMethod,
    pub service_name: String,
    #[serde(default)]
    pub strip_prefix: bool,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    /// When false the gateway neither consults nor updates the breaker.
    #[serde(default = "default_true")]
    pub circuit_breaker: bool,
    pub rate_limit: Option<RateLimitHint>,
    #[serde(default)]
    pub authentication: bool,
    #[serde(default)]
    pub authorization: Vec<String>,
    #[serde(default)]
    pub transform_request: bool,
    #[serde(default)]
    pub transform_response: bool,
    pub cache: Option<CachePolicy>,
}

impl ServiceRoute {
    /// Route with default policy: breaker enabled, no timeout, no retries.
    pub fn new(method: RouteMethod, path: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            service_name: service_name.into(),
            strip_prefix: false,
            timeout_ms: None,
            retries: 0,
            circuit_breaker: true,
            rate_limit: None,
            authentication: false,
            authorization: Vec::new(),
            transform_request: false,
            transform_response: false,
            cache: None,
        }
    }

    /// Route table key: `"METHOD:path"`.
    #[must_use]
    pub fn key(&self) -> String {
        route_key(self.method.as_str(), &self.path)
    }

    #[must_use]
    pub fn with_strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker = enabled;
        self
    }

    #[must_use]
    pub fn with_authentication(mut self, required: bool) -> Self {
        self.authentication = required;
        self
    }
}

/// Builds the `"METHOD:path"` key used by the route table.
#[must_use]
pub fn route_key(method: &str, path: &str) -> String {
    format!("{}:{path}", method.to_ascii_uppercase())
}
