//! Lagscale Kubernetes Operator
//!
//! Keeps the HorizontalPodAutoscaler of each ConsumerAutoscaler bounded by
//! the partition count of the Kafka topic it consumes.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use lagscale_operator::config::{BackoffPolicy, OperatorConfig};
use lagscale_operator::controller::{self, Readiness};
use lagscale_operator::crd;
use lagscale_operator::store::KubeStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Lagscale Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "lagscale-operator")]
#[command(about = "Kubernetes operator that bounds Kafka consumer autoscaling by topic partitions")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Liveness and readiness endpoint address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Deadline for a single reconcile cycle
    #[arg(long, env = "CYCLE_TIMEOUT_SECS", default_value = "30")]
    cycle_timeout_secs: u64,

    /// Interval between full resyncs
    #[arg(long, env = "RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// Delay before the first retry of a failed cycle
    #[arg(long, env = "BACKOFF_INITIAL_SECS", default_value = "5")]
    backoff_initial_secs: u64,

    /// Upper bound on the retry delay
    #[arg(long, env = "BACKOFF_MAX_SECS", default_value = "300")]
    backoff_max_secs: u64,

    /// Retry delay growth factor
    #[arg(long, env = "BACKOFF_MULTIPLIER", default_value = "2")]
    backoff_multiplier: u32,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            workers: self.workers,
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            backoff: BackoffPolicy {
                initial: Duration::from_secs(self.backoff_initial_secs),
                multiplier: self.backoff_multiplier,
                max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        return print_crd();
    }

    init_logging(&args);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        "Starting Lagscale Kubernetes Operator"
    );

    install_metrics_exporter(args.metrics_addr)?;

    let readiness = Readiness::new();
    let health_addr = args.health_addr;
    let health = readiness.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_addr, health).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Empty string means cluster-wide
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace.clone())
    };

    let store = Arc::new(KubeStore::new(client, namespace));
    controller::run_controller(store, args.operator_config(), readiness, shutdown_signal())
        .await
        .context("Controller failed")?;

    info!("Operator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// RUST_LOG wins over `--log-level` when set
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Serve `/metrics` on `addr` from the exporter's own task
fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", addr))?;
    controller::describe_metrics();

    info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
const NOT_READY: &str = "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 9\r\n\r\nNot ready";
const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot found";

/// Pick the reply for a raw HTTP request.
///
/// `/healthz` answers as long as the process runs; `/readyz` only once the
/// controller has listed its autoscalers and until shutdown starts.
fn health_response(request: &str, ready: bool) -> &'static str {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    match path {
        "/" | "/healthz" => OK,
        "/readyz" if ready => OK,
        "/readyz" => NOT_READY,
        _ => NOT_FOUND,
    }
}

async fn serve_health(addr: SocketAddr, readiness: Readiness) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health server on {}", addr))?;
    info!(address = %addr, "Health server listening");

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let readiness = readiness.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let read = match socket.read(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Failed to read health request");
                    return;
                }
            };
            let request = String::from_utf8_lossy(&buf[..read]);
            let response = health_response(&request, readiness.is_ready());
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Write the CRD YAML for installation to stdout
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    serde_yaml::to_writer(std::io::stdout().lock(), &crd::ConsumerAutoscaler::crd())
        .context("Failed to render CRD")
}
