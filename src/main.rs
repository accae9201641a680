//! Nearline Cache Daemon
//!
//! Runs the cache services of one node: reconciles every configured tenant
//! partition at startup, then purges expired files on a fixed interval.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Nearline Cache Daemon                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │Reconciliation│───▶│  Scheduler   │───▶│   Eviction   │       │
//! │  │  (startup)   │    │  (interval)  │    │ (per tenant) │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nearline_cache::adapters::{JsonFileCacheIndex, LoggingEventPublisher, StaticTenantResolver};
use nearline_cache::cache::{CacheMetrics, CacheServices};
use nearline_cache::config::{parse_duration, CacheConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Nearline Cache - tenant-partitioned disk cache in front of nearline storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "NEARLINE_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root directory (overrides the configuration file)
    #[arg(long, env = "CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Cache index directory (overrides the configuration file)
    #[arg(long, env = "CACHE_INDEX_DIR")]
    index_dir: Option<PathBuf>,

    /// Tenants served by this node, comma separated
    #[arg(long, env = "CACHE_TENANTS", value_delimiter = ',')]
    tenants: Vec<String>,

    /// Interval between purges (e.g. "5m", "1h30m")
    #[arg(long, env = "PURGE_INTERVAL")]
    purge_interval: Option<String>,

    /// Per-tenant quota in KiB applied when no override is configured
    #[arg(long, env = "DEFAULT_QUOTA_KB")]
    default_quota_kb: Option<u64>,

    /// Also evict unexpired files when a tenant is over quota
    #[arg(long, env = "SIZE_EVICTION")]
    size_eviction: bool,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Configuration file (or defaults) with command-line overrides applied.
    fn load_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => CacheConfig::default(),
        };

        if let Some(root) = &self.cache_root {
            config.cache_root = root.clone();
        }
        if let Some(dir) = &self.index_dir {
            config.index_dir = Some(dir.clone());
        }
        if !self.tenants.is_empty() {
            config.tenants = self.tenants.clone();
        }
        if let Some(interval) = &self.purge_interval {
            config.purge_interval = parse_duration(interval).context("parsing --purge-interval")?;
        }
        if let Some(quota) = self.default_quota_kb {
            config.default_quota_kb = quota;
        }
        if self.size_eviction {
            config.size_eviction_enabled = true;
        }

        config.validate().context("validating configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = args.load_config()?;

    info!("Starting Nearline Cache");
    info!("  Cache root: {}", config.cache_root.display());
    info!("  Index directory: {}", config.index_dir().display());
    info!("  Tenants: {:?}", config.tenants);
    info!("  Purge interval: {:?}", config.purge_interval);
    info!("  Default quota: {} KiB", config.default_quota_kb);
    info!("  Size eviction: {}", config.size_eviction_enabled);

    let index = JsonFileCacheIndex::open(config.index_dir())
        .await
        .context("opening cache index")?;
    for tenant in index.tenants() {
        if !config.tenants.iter().any(|t| t == tenant.as_str()) {
            warn!(
                tenant = %tenant,
                "Cache index holds entries for a tenant this node does not serve"
            );
        }
    }

    let resolver = Arc::new(StaticTenantResolver::new(config.tenants.clone()));
    let services = CacheServices::build(
        config,
        Arc::new(index),
        Arc::new(LoggingEventPublisher::info_level()),
        resolver,
        Arc::new(CacheMetrics::exported()),
    )
    .context("building cache services")?;

    // Initialize partitions and repair index/disk divergence
    let report = services
        .reconciliation
        .reconcile_all()
        .await
        .context("reconciling cache partitions")?;
    for (tenant, tenant_report) in &report.reconciled {
        info!(
            tenant = %tenant,
            removed_entries = tenant_report.removed_entries,
            unindexed_files = tenant_report.unindexed_files,
            "Cache partition ready"
        );
    }
    for (tenant, e) in &report.failed {
        error!(tenant = %tenant, "Cache partition unavailable: {}", e);
    }

    let ready = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    // Run the scheduler
    let scheduler = tokio::spawn(services.scheduler.clone().run(shutdown.clone()));
    ready.store(true, Ordering::Relaxed);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    ready.store(false, Ordering::Relaxed);
    shutdown.cancel();

    if let Err(e) = scheduler.await {
        error!("Cache scheduler task failed: {}", e);
    }

    info!("Nearline Cache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
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
        .add_directive("walkdir=warn".parse()?);

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

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health server to {}", addr))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let is_ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if is_ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                match encoder.encode(&prometheus::gather(), &mut buffer) {
                    Ok(()) => {
                        let mut response = Response::new(Full::new(Bytes::from(buffer)));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                        response
                    }
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        let mut response = Response::new(Full::new(Bytes::from("encoding error")));
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        response
                    }
                }
            }
            _ => {
                let mut response = Response::new(Full::new(Bytes::from("not found")));
                *response.status_mut() = StatusCode::NOT_FOUND;
                response
            }
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
