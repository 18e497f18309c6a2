//! Operational HTTP surface over a running [`ServiceMesh`].
//!
//! Deferred startup: `new()` allocates shared state, `start()` binds the
//! listener, `serve()` accepts connections until the shutdown future fires or
//! the mesh shuts down.

pub mod handlers;
pub mod lifecycle;
pub mod middleware;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use handlers::AppState;
pub use lifecycle::{AdminLifecycle, RequestGuard, ServerState};

use self::handlers::{
    breakers_handler, dead_letters_handler, gateway_handler, health_handler, mesh_health_handler,
    reset_breaker_handler, retry_dead_letter_handler, routes_handler, services_handler,
    snapshot_handler, status_handler, sweep_handler, traces_handler,
};
use self::middleware::build_http_layers;
use crate::config::AdminConfig;
use crate::mesh::ServiceMesh;

/// Assembles the admin router.
///
/// Routes:
/// - `GET /health`
/// - `GET /mesh/status`, `/mesh/services`, `/mesh/health`, `/mesh/routes`
/// - `GET /mesh/breakers`, `POST /mesh/breakers/{service}/reset`
/// - `GET /mesh/traces?limit=`
/// - `GET /mesh/dead-letters`, `POST /mesh/dead-letters/{id}/retry`
/// - `POST /mesh/gateway`
/// - `POST /mesh/sweep`, `POST /mesh/snapshot`
pub fn build_router(state: AppState, config: &AdminConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mesh/status", get(status_handler))
        .route("/mesh/services", get(services_handler))
        .route("/mesh/health", get(mesh_health_handler))
        .route("/mesh/breakers", get(breakers_handler))
        .route("/mesh/breakers/{service}/reset", post(reset_breaker_handler))
        .route("/mesh/routes", get(routes_handler))
        .route("/mesh/traces", get(traces_handler))
        .route("/mesh/dead-letters", get(dead_letters_handler))
        .route("/mesh/dead-letters/{id}/retry", post(retry_dead_letter_handler))
        .route("/mesh/gateway", post(gateway_handler))
        .route("/mesh/sweep", post(sweep_handler))
        .route("/mesh/snapshot", post(snapshot_handler))
        .layer(build_http_layers(config))
        .with_state(state)
}

/// Admin HTTP server lifecycle.
pub struct AdminServer {
    config: AdminConfig,
    mesh: Arc<ServiceMesh>,
    listener: Option<TcpListener>,
    lifecycle: Arc<AdminLifecycle>,
}

impl AdminServer {
    #[must_use]
    pub fn new(config: AdminConfig, mesh: Arc<ServiceMesh>) -> Self {
        let lifecycle = Arc::new(AdminLifecycle::new(&mesh.shutdown_token()));
        Self {
            config,
            mesh,
            listener: None,
            lifecycle,
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Arc<AdminLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    #[must_use]
    pub fn router(&self) -> Router {
        let state = AppState::new(Arc::clone(&self.mesh), Arc::clone(&self.lifecycle));
        build_router(state, &self.config)
    }

    /// Binds the listener and returns the bound port, which differs from the
    /// configured one when that is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "admin listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.router();
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;

        let lifecycle = Arc::clone(&self.lifecycle);
        let stop = async move {
            tokio::select! {
                () = shutdown => {}
                () = lifecycle.cancelled() => {}
            }
            lifecycle.begin_drain();
        };

        self.lifecycle.mark_ready();
        axum::serve(listener, router)
            .with_graceful_shutdown(stop)
            .await?;

        if self.lifecycle.drain(self.config.drain_timeout).await {
            info!("admin requests drained");
        } else {
            warn!(
                in_flight = self.lifecycle.in_flight(),
                "drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }
}
