//! Pipeline composition: combines the gateway layers into one service stack.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::config::MeshConfig;
use crate::gateway::service::GatewayService;

/// The composed gateway service stack.
pub type GatewayPipeline = LoadShedService<MetricsService<GatewayService>>;

/// Wraps a [`GatewayService`] with the middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- answer 503 when overloaded, before doing any work
/// 2. `MetricsLayer` -- record timing and outcome around the gateway itself
#[must_use]
pub fn build_gateway_pipeline(service: GatewayService, config: &MeshConfig) -> GatewayPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_calls))
        .layer(MetricsLayer)
        .service(service)
}
