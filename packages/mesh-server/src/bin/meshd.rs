//! meshd: runs an in-memory service mesh with its admin HTTP surface.
//!
//! ```text
//! meshd --port 7070 --seed-defaults --log-format json --metrics-port 9090
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use meshkit_core::LoadBalancingStrategy;
use meshkit_server::admin::AdminServer;
use meshkit_server::config::{AdminConfig, MeshConfig};
use meshkit_server::telemetry::{self, LogFormat};
use meshkit_server::ServiceMesh;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "meshd", about = "In-memory service mesh daemon", version)]
struct Cli {
    /// Admin bind address.
    #[arg(long, env = "MESHKIT_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Admin port. 0 picks a free port.
    #[arg(long, env = "MESHKIT_PORT", default_value_t = 7070)]
    port: u16,

    #[arg(long, env = "MESHKIT_NODE_ID", default_value = "mesh-1")]
    node_id: String,

    /// Load balancing strategy.
    #[arg(long, env = "MESHKIT_STRATEGY", default_value = "round-robin", value_parser = parse_strategy)]
    strategy: LoadBalancingStrategy,

    /// Heartbeat sweep interval in milliseconds.
    #[arg(long, env = "MESHKIT_HEALTH_CHECK_INTERVAL_MS", default_value_t = 10_000)]
    health_check_interval_ms: u64,

    /// Metrics snapshot interval in milliseconds.
    #[arg(long, env = "MESHKIT_METRICS_INTERVAL_MS", default_value_t = 60_000)]
    metrics_interval_ms: u64,

    /// Concurrent gateway calls before load shedding.
    #[arg(long, env = "MESHKIT_MAX_CONCURRENT_CALLS", default_value_t = 1000)]
    max_concurrent_calls: u32,

    #[arg(long, env = "MESHKIT_MAX_TRACES", default_value_t = 10_000)]
    max_traces: usize,

    /// Image registry prefix for deployment descriptors.
    #[arg(long, env = "MESHKIT_IMAGE_REGISTRY", default_value = "meshkit")]
    image_registry: String,

    /// Register the default platform services and their routes.
    #[arg(long, env = "MESHKIT_SEED_DEFAULTS")]
    seed_defaults: bool,

    #[arg(long, env = "MESHKIT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "MESHKIT_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Seconds to wait for in-flight admin requests on shutdown.
    #[arg(long, env = "MESHKIT_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,
}

fn parse_strategy(value: &str) -> Result<LoadBalancingStrategy, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|_| {
        format!(
            "unknown strategy {value:?}; expected round-robin, least-connections, weighted, random or ip-hash"
        )
    })
}

impl Cli {
    fn mesh_config(&self) -> MeshConfig {
        let mut config = MeshConfig {
            node_id: self.node_id.clone(),
            max_traces: self.max_traces,
            metrics_interval_ms: self.metrics_interval_ms,
            max_concurrent_calls: self.max_concurrent_calls,
            image_registry: self.image_registry.clone(),
            ..MeshConfig::default()
        };
        config.load_balancer.strategy = self.strategy;
        config.load_balancer.health_check_interval_ms = self.health_check_interval_ms;
        config
    }

    fn admin_config(&self) -> AdminConfig {
        AdminConfig {
            host: self.host.clone(),
            port: self.port,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..AdminConfig::default()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_format, "info")?;
    if let Some(port) = cli.metrics_port {
        telemetry::init_metrics(SocketAddr::from(([0, 0, 0, 0], port)))?;
    }

    let mesh = Arc::new(ServiceMesh::new(cli.mesh_config()));
    if cli.seed_defaults {
        mesh.seed_defaults()?;
    }
    mesh.start_background();

    let mut server = AdminServer::new(cli.admin_config(), Arc::clone(&mesh));
    let port = server.start().await?;
    info!(
        node_id = %mesh.config().node_id,
        port,
        strategy = %mesh.strategy(),
        "meshd ready"
    );

    server.serve(shutdown_signal()).await?;
    mesh.shutdown().await;
    info!("meshd stopped");
    Ok(())
}
