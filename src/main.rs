//! HostPath Provisioner Operator
//!
//! Entry point: parses flags, sets up logging, then runs the controller next
//! to the health, metrics and admission webhook servers.

use anyhow::Context;
use clap::Parser;
use hyper::{Body, Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hostpath_provisioner_operator::controlplane::api::{WebhookServer, WebhookServerConfig};
use hostpath_provisioner_operator::controlplane::runtime;
use hostpath_provisioner_operator::controlplane::{
    EnvNamespaceProvider, FileVersionProvider, KubeEventSink, Metrics, Reconciler,
    StaticNamespaceProvider, StaticVersionProvider,
};
use hostpath_provisioner_operator::domain::{
    NamespaceProvider, NamespaceProviderRef, VersionProviderRef,
};
use hostpath_provisioner_operator::{KubeObjectStore, OperatorConfig, Store};

// =============================================================================
// CLI Arguments
// =============================================================================

/// HostPath Provisioner Operator - deploys and reconciles the hostpath CSI driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Admission webhook bind address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Serve the validating admission webhook
    #[arg(long, env = "ENABLE_WEBHOOK")]
    enable_webhook: bool,

    /// Namespace the provisioner is installed into
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Version of the operator, takes precedence over the version file
    #[arg(long, env = "OPERATOR_VERSION")]
    operator_version: Option<String>,

    /// File whose first line is the operator version
    #[arg(long, env = "VERSION_FILE")]
    version_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting HostPath Provisioner Operator");
    info!("  Version: {}", hostpath_provisioner_operator::VERSION);
    info!("  Webhook: {}", args.enable_webhook);

    let config = OperatorConfig::from_env().context("invalid operator configuration")?;
    let namespace = namespace_provider(&args);
    let version = version_provider(&args);
    let install_namespace = namespace
        .namespace()
        .context("unable to determine the install namespace")?;
    info!("  Namespace: {}", install_namespace);

    let metrics = Metrics::new(prometheus::default_registry())
        .context("unable to register metrics")?;
    let ready = Arc::new(AtomicBool::new(false));

    let health_ready = ready.clone();
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let webhook = Arc::new(WebhookServer::new(WebhookServerConfig {
        addr: args.webhook_addr,
    }));
    if args.enable_webhook {
        let webhook = webhook.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook.run().await {
                error!("Webhook server error: {}", e);
            }
        });
    }

    let client = kube::Client::try_default()
        .await
        .context("unable to create Kubernetes client")?;
    runtime::wait_for_crd(client.clone())
        .await
        .context("HostPathProvisioner CRD is not installed")?;

    let reconciler = Arc::new(Reconciler::new(
        Store::new(Arc::new(KubeObjectStore::new(client.clone()))),
        Arc::new(config),
        Arc::new(KubeEventSink::new(client.clone())),
        namespace,
        version,
        metrics,
    ));
    ready.store(true, Ordering::Relaxed);

    runtime::run(client, reconciler, &install_namespace).await;

    webhook.shutdown();
    info!("Operator shutdown complete");
    Ok(())
}

fn namespace_provider(args: &Args) -> NamespaceProviderRef {
    match &args.watch_namespace {
        Some(ns) => Arc::new(StaticNamespaceProvider(ns.clone())),
        None => Arc::new(EnvNamespaceProvider),
    }
}

fn version_provider(args: &Args) -> VersionProviderRef {
    match (&args.operator_version, &args.version_file) {
        (Some(version), _) => Arc::new(StaticVersionProvider(version.clone())),
        (None, Some(path)) => Arc::new(FileVersionProvider::new(path)),
        (None, None) => {
            warn!("No operator version given, using the build version");
            Arc::new(StaticVersionProvider(
                hostpath_provisioner_operator::VERSION.to_string(),
            ))
        }
    }
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
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?);

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

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("health server failed")
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("metrics server failed")
}
