//! Metrics middleware for gateway calls.
//!
//! Wraps each call in a `gateway_call` tracing span and records its wall-clock
//! duration and status code on completion.

use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Instant;

use meshkit_core::{GatewayRequest, GatewayResponse};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::gateway::service::GatewayFuture;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments gateway calls with timing and outcome.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<GatewayRequest> for MetricsService<S>
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
        let span = info_span!(
            "gateway_call",
            method = %request.method,
            path = %request.path,
            service = tracing::field::Empty,
            status = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let current = tracing::Span::current();
                current.record("duration_ms", duration_ms);
                if let Ok(response) = &result {
                    current.record("service", response.service_name.as_str());
                    current.record("status", response.status_code);
                    tracing::info!(
                        service = %response.service_name,
                        instance_id = %response.instance_id,
                        status = response.status_code,
                        duration_ms,
                        "gateway call complete"
                    );
                }
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    /// Immediately-completing service for metrics testing.
    struct ImmediateService;

    impl Service<GatewayRequest> for ImmediateService {
        type Response = GatewayResponse;
        type Error = Infallible;
        type Future = GatewayFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: GatewayRequest) -> Self::Future {
            Box::pin(async move {
                Ok(GatewayResponse {
                    status_code: 200,
                    headers: BTreeMap::new(),
                    body: json!({ "path": request.path }),
                    duration_ms: 0,
                    service_name: "billing".to_string(),
                    instance_id: "b-1".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(ImmediateService);
        let resp = svc
            .oneshot(GatewayRequest::new("GET", "/api/billing/x"))
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body["path"], "/api/billing/x");
    }
}
