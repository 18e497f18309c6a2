//! Load-shedding middleware for gateway calls.
//!
//! Answers with a 503 when the number of in-flight calls reaches
//! `max_concurrent_calls`.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use meshkit_core::{GatewayRequest, GatewayResponse};
use serde_json::json;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use crate::gateway::service::GatewayFuture;
use crate::gateway::GATEWAY_SERVICE;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent gateway calls via a semaphore.
///
/// When all permits are taken, incoming calls are answered immediately with
/// a 503 rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

fn overloaded(path: &str) -> GatewayResponse {
    GatewayResponse {
        status_code: 503,
        headers: BTreeMap::new(),
        body: json!({ "error": "Gateway overloaded", "path": path }),
        duration_ms: 0,
        service_name: GATEWAY_SERVICE.to_string(),
        instance_id: "unknown".to_string(),
    }
}

impl<S> Service<GatewayRequest> for LoadShedService<S>
where
    S: Service<GatewayRequest, Response = GatewayResponse, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = GatewayResponse;
    type Error = Infallible;
    type Future = GatewayFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: GatewayRequest) -> Self::Future {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            warn!(path = %request.path, "gateway overloaded, shedding call");
            metrics::counter!(
                "meshkit_gateway_requests_total",
                "service" => GATEWAY_SERVICE,
                "status" => "503"
            )
            .increment(1);
            let response = overloaded(&request.path);
            return Box::pin(async move { Ok(response) });
        };

        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
