//! Storage Module Operator
//!
//! Installs CSI drivers and their optional modules from ContainerStorageModule
//! resources, and connectivity agents from ConnectivityClient resources.

use anyhow::Context as _;
use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_module_operator::config::DEFAULT_CONFIG_DIR;
use storage_module_operator::controlplane::runtime;
use storage_module_operator::{
    ConnectivityClient, ContainerStorageModule, DirConfigTree, Error, KubeVersion,
    ManifestResolver, Metrics, OperatorConfig, Platform, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Module Operator - CSI drivers and modules from versioned manifests
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root of the driver/module/client manifest tree
    #[arg(long, env = "CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Cluster distribution (kubernetes, openshift)
    #[arg(long, env = "PLATFORM", default_value = "kubernetes")]
    platform: String,

    /// Only reconcile resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Reconciles running at once per resource kind
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value = "1")]
    max_concurrent_reconciles: u16,

    /// Kubernetes version used to pick image values, e.g. 1.29
    #[arg(long, env = "K8S_VERSION")]
    k8s_version: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print both CRDs as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> Result<OperatorConfig> {
        let platform: Platform = self.platform.parse().map_err(Error::Configuration)?;
        let kube_version = self
            .k8s_version
            .as_deref()
            .map(str::parse::<KubeVersion>)
            .transpose()?;

        Ok(OperatorConfig {
            config_dir: self.config_dir.clone(),
            platform,
            watch_namespace: self.watch_namespace.clone().filter(|ns| !ns.is_empty()),
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            kube_version,
            ..Default::default()
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let crds = [
            serde_yaml::to_string(&ContainerStorageModule::crd())?,
            serde_yaml::to_string(&ConnectivityClient::crd())?,
        ];
        print!("{}", crds.join("---\n"));
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config()?;
    config.validate()?;

    info!("Starting Storage Module Operator");
    info!("  Version: {}", storage_module_operator::VERSION);
    info!("  Config dir: {}", config.config_dir.display());
    info!("  Platform: {}", config.platform);
    info!(
        "  Watch namespace: {}",
        config.watch_namespace.as_deref().unwrap_or("<all>")
    );

    let resolver = ManifestResolver::new(Arc::new(DirConfigTree::new(config.config_dir.clone())));

    let metrics = Arc::new(Metrics::new()?);
    metrics.register(prometheus::default_registry())?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let ctx = runtime::build_context(client.clone(), config, resolver, metrics);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    runtime::run(client, ctx).await;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
