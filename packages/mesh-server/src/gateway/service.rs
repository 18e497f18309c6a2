//! `tower::Service` adapter over [`Gateway`].

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use meshkit_core::{GatewayRequest, GatewayResponse};
use tower::Service;

use super::Gateway;

/// Boxed future returned by every gateway service in the stack.
pub type GatewayFuture = Pin<Box<dyn Future<Output = Result<GatewayResponse, Infallible>> + Send>>;

/// Exposes [`Gateway::handle`] as a `tower::Service`.
///
/// Always ready and never errors; failures are status codes on the response.
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

impl Service<GatewayRequest> for GatewayService {
    type Response = GatewayResponse;
    type Error = Infallible;
    type Future = GatewayFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: GatewayRequest) -> Self::Future {
        let gateway = Arc::clone(&self.gateway);
        Box::pin(async move { Ok(gateway.handle(request).await) })
    }
}
