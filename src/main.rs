//! Bulwark Service
//!
//! Hosts a [`Bulwark`] context and exposes its health and metrics.
//!
//! # Endpoints
//!
//! ```text
//! health server   /healthz  cache round-trip + breaker states (JSON)
//!                 /livez    process liveness
//!                 /readyz   readiness, cleared while draining
//! metrics server  /metrics  Prometheus text exposition
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use bulwark::{Bulwark, BulwarkConfig, StrategyKind};
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Bulwark - circuit breaking and stampede-safe caching
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured cache strategy (in-process, distributed)
    #[arg(long, env = "CACHE_STRATEGY")]
    strategy: Option<String>,

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

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Bulwark");

    let mut config = match &args.config {
        Some(path) => BulwarkConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BulwarkConfig::default(),
    };
    if let Some(strategy) = &args.strategy {
        config.cache.default_strategy = strategy
            .parse::<StrategyKind>()
            .context("invalid --strategy")?;
    }

    info!("  Strategy: {}", config.cache.default_strategy);
    info!("  Default TTL: {}s", config.cache.default_ttl_secs);
    info!("  Compression: {}", config.cache.compression.enabled);
    info!("  Partitioning: {}", config.cache.partition.enabled);

    let bulwark = Bulwark::from_config(config)
        .await
        .context("initializing bulwark context")?;

    let health_addr: SocketAddr = args
        .health_addr
        .parse()
        .with_context(|| format!("invalid health server address '{}'", args.health_addr))?;
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics server address '{}'", args.metrics_addr))?;

    let health_ctx = bulwark.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(health_addr, "health", health_ctx, health_handler).await {
            error!("Health server error: {:#}", e);
        }
    });

    let metrics_ctx = bulwark.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(metrics_addr, "metrics", metrics_ctx, metrics_handler).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutdown signal received");
    bulwark.shutdown().await;

    info!("Bulwark shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
}

// =============================================================================
// HTTP Servers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn not_found() -> HttpResponse {
    response(StatusCode::NOT_FOUND, "text/plain", "not found")
}

async fn health_handler(
    ctx: Bulwark,
    req: Request<hyper::body::Incoming>,
) -> Result<HttpResponse, Infallible> {
    let probe = ctx.probe();
    let response = match req.uri().path() {
        "/healthz" => {
            let health = ctx.health().await;
            let status = if health.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&health) {
                Ok(body) => response(status, "application/json", body),
                Err(e) => response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("failed to encode health: {}", e),
                ),
            }
        }
        "/livez" if probe.is_live() => response(StatusCode::OK, "text/plain", "ok"),
        "/readyz" if probe.is_ready() => response(StatusCode::OK, "text/plain", "ok"),
        "/livez" | "/readyz" => response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "unavailable"),
        _ => not_found(),
    };
    Ok(response)
}

async fn metrics_handler(
    ctx: Bulwark,
    req: Request<hyper::body::Incoming>,
) -> Result<HttpResponse, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match ctx.metrics().encode() {
            Ok(text) => response(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                format!("failed to encode metrics: {}", e),
            ),
        },
        _ => not_found(),
    };
    Ok(response)
}

async fn serve<H, Fut>(addr: SocketAddr, name: &'static str, ctx: Bulwark, handler: H) -> anyhow::Result<()>
where
    H: Fn(Bulwark, Request<hyper::body::Incoming>) -> Fut + Copy + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HttpResponse, Infallible>> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server on {}", name, addr))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .with_context(|| format!("{} server accept error", name))?;

        let io = TokioIo::new(stream);
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handler(ctx.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
