//! Tower middleware layers for the gateway.
//!
//! - [`load_shed`]: Semaphore-based concurrency limiting, answered with 503
//! - [`metrics`]: Call timing and outcome via a `tracing` span
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_gateway_pipeline, GatewayPipeline};
