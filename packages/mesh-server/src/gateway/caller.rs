//! Dispatch seam between the gateway and the services it routes to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use meshkit_core::{ClockSource, GatewayRequest, ServiceInstance, ServiceRoute};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Everything a caller needs to issue one dispatch.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub instance: ServiceInstance,
    pub route: ServiceRoute,
    pub request: GatewayRequest,
    /// Request path after prefix stripping.
    pub forward_path: String,
    pub params: BTreeMap<String, String>,
    pub trace_id: String,
}

/// What a service answered.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// Performs the call to a selected instance.
///
/// An `Err` is a dispatch failure: it counts against the service's breaker
/// and surfaces as a 500. `cancel` fires when the route timeout elapses or
/// the mesh shuts down; implementations should stop work when it does.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn call(&self, call: &ServiceCall, cancel: CancellationToken) -> anyhow::Result<CallResponse>;
}

/// In-memory caller that answers every call with a canned 200.
pub struct SimulatedCaller {
    clock: Arc<dyn ClockSource>,
}

impl SimulatedCaller {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl ServiceCaller for SimulatedCaller {
    async fn call(&self, call: &ServiceCall, _cancel: CancellationToken) -> anyhow::Result<CallResponse> {
        let instance = &call.instance;
        let headers = BTreeMap::from([
            ("x-service-name".to_string(), instance.name.clone()),
            ("x-instance-id".to_string(), instance.id.clone()),
            ("x-response-time".to_string(), "50".to_string()),
        ]);
        Ok(CallResponse {
            status_code: 200,
            headers,
            body: json!({
                "success": true,
                "service": instance.name,
                "instance": instance.id,
                "path": call.forward_path,
                "method": call.request.method,
                "timestamp": self.clock.now(),
            }),
        })
    }
}
