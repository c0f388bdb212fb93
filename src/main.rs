//! Flash-Sale Order Pipeline
//!
//! Runs the pipeline against the in-memory stores: seeds demo inventory,
//! drains the order stream, serves health and metrics, and optionally fires
//! a burst of simulated purchase attempts.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      flashsale                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  AdmissionGate ──▶ stream.orders ──▶ QueueProcessor (x2)     │
//! │        │                                   │                 │
//! │   cache + bloom                      OrderFulfiller          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashsale::adapters::{LoggingEventPublisher, MemoryFastStore, MemoryOrderStore};
use flashsale::cache::{BloomConfig, CacheConfig, CacheStrategy};
use flashsale::domain::model::{InventoryItem, Shop};
use flashsale::fulfillment::FulfillmentConfig;
use flashsale::queue::QueueConfig;
use flashsale::{Pipeline, PipelineConfig, PipelineMetrics};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Flash-sale order pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of demo flash-sale items to seed
    #[arg(long, env = "DEMO_ITEMS", default_value = "1")]
    demo_items: i64,

    /// Stock of each demo item
    #[arg(long, env = "DEMO_STOCK", default_value = "100")]
    demo_stock: i64,

    /// Simulated purchase attempts against item 1 at startup (0 disables)
    #[arg(long, env = "BURST_USERS", default_value = "0")]
    burst_users: i64,

    /// Artificial latency of durable-store point reads in milliseconds
    #[arg(long, env = "STORE_READ_DELAY_MS", default_value = "0")]
    store_read_delay_ms: u64,

    /// Cache entry TTL in seconds
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value = "1800")]
    cache_ttl_seconds: u64,

    /// Null marker TTL in seconds
    #[arg(long, env = "CACHE_NULL_TTL_SECONDS", default_value = "120")]
    cache_null_ttl_seconds: u64,

    /// Logical expiry window in seconds
    #[arg(long, env = "CACHE_LOGICAL_TTL_SECONDS", default_value = "10")]
    cache_logical_ttl_seconds: u64,

    /// Expected number of ids for bloom filter sizing
    #[arg(long, env = "BLOOM_EXPECTED_ITEMS", default_value = "100000")]
    bloom_expected_items: u64,

    /// Target bloom filter false-positive rate
    #[arg(long, env = "BLOOM_FALSE_POSITIVE_RATE", default_value = "0.01")]
    bloom_false_positive_rate: f64,

    /// Fulfillment lock TTL in seconds
    #[arg(long, env = "LOCK_TTL_SECONDS", default_value = "10")]
    lock_ttl_seconds: u64,

    /// Fulfillment lock acquisition timeout in seconds
    #[arg(long, env = "LOCK_TIMEOUT_SECONDS", default_value = "15")]
    lock_timeout_seconds: u64,

    /// Failed redeliveries before an entry is dead-lettered
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Idle time before a pending entry is redelivered, in seconds
    #[arg(long, env = "PENDING_MIN_IDLE_SECONDS", default_value = "90")]
    pending_min_idle_seconds: u64,

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
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            cache: CacheConfig {
                ttl: Duration::from_secs(self.cache_ttl_seconds),
                null_ttl: Duration::from_secs(self.cache_null_ttl_seconds),
                logical_ttl: Duration::from_secs(self.cache_logical_ttl_seconds),
                ..CacheConfig::default()
            },
            bloom: BloomConfig {
                expected_items: self.bloom_expected_items,
                false_positive_rate: self.bloom_false_positive_rate,
            },
            queue: QueueConfig {
                max_retries: self.max_retries,
                pending_min_idle: Duration::from_secs(self.pending_min_idle_seconds),
                ..QueueConfig::default()
            },
            fulfillment: FulfillmentConfig {
                lock_ttl: Duration::from_secs(self.lock_ttl_seconds),
                lock_timeout: Duration::from_secs(self.lock_timeout_seconds),
                ..FulfillmentConfig::default()
            },
            ..PipelineConfig::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting flash-sale pipeline");
    info!("  Demo items: {} x {} stock", args.demo_items, args.demo_stock);
    info!("  Max retries: {}", args.max_retries);
    info!(
        "  Lock TTL / timeout: {}s / {}s",
        args.lock_ttl_seconds, args.lock_timeout_seconds
    );

    let fast = Arc::new(MemoryFastStore::new());
    let mut durable = MemoryOrderStore::new();
    if args.store_read_delay_ms > 0 {
        durable = durable.with_read_delay(Duration::from_millis(args.store_read_delay_ms));
    }
    let durable = Arc::new(durable);

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::build(
        fast,
        durable.clone(),
        Arc::new(LoggingEventPublisher::info_level()),
        args.pipeline_config(),
        cancel.clone(),
    )
    .context("building pipeline")?;

    seed_demo(&pipeline, &args).await?;

    let loops = pipeline.start().await.context("starting queue consumers")?;
    info!("Queue consumers running");

    let ready = Arc::new(AtomicBool::new(true));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics = pipeline.metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    if args.burst_users > 0 {
        run_burst(&pipeline, args.burst_users).await;
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    ready.store(false, Ordering::SeqCst);

    pipeline.shutdown().await;
    for handle in loops {
        if let Err(e) = handle.await {
            warn!("Consumer task ended abnormally: {}", e);
        }
    }

    info!(orders = durable.order_count().await, "Pipeline shutdown complete");
    Ok(())
}

// =============================================================================
// Demo Data
// =============================================================================

async fn seed_demo(pipeline: &Pipeline, args: &Args) -> anyhow::Result<()> {
    let now = Utc::now();
    for id in 1..=args.demo_items {
        let item = InventoryItem::new(
            id,
            args.demo_stock,
            now - chrono::Duration::minutes(1),
            now + chrono::Duration::hours(1),
        );
        pipeline
            .inventory
            .add_item(&item)
            .await
            .with_context(|| format!("seeding item {}", id))?;
    }

    let shop = Shop {
        id: 1,
        name: "Flagship Store".to_string(),
        type_id: 1,
        address: "1 Market Street".to_string(),
        score: 47,
    };
    pipeline.shops.update_shop(&shop).await?;
    pipeline.shops.cache().warm_logical(shop.id).await?;

    info!(items = args.demo_items, "Demo inventory seeded");
    Ok(())
}

async fn run_burst(pipeline: &Pipeline, users: i64) {
    info!(users, "Firing admission burst against item 1");

    let attempts: Vec<_> = (1..=users)
        .map(|user_id| {
            let gate = pipeline.admission.clone();
            tokio::spawn(async move { gate.admit(1, user_id).await })
        })
        .collect();

    let (mut admitted, mut rejected, mut failed) = (0u64, 0u64, 0u64);
    for attempt in attempts {
        match attempt.await {
            Ok(Ok(_)) => admitted += 1,
            Ok(Err(e)) if e.is_rejection() => rejected += 1,
            Ok(Err(_)) | Err(_) => failed += 1,
        }
    }
    info!(admitted, rejected, failed, "Admission burst finished");

    match pipeline.shops.query(1, CacheStrategy::LogicalExpiration).await {
        Ok(shop) => info!(shop = %shop.name, "Shop lookup served from cache"),
        Err(e) => warn!("Shop lookup failed: {}", e),
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
        .add_directive("tower=warn".parse()?);

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

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
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

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Route a metrics-server request. The registry is only gathered for `/metrics`.
fn metrics_response<F>(path: &str, encode: F) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>>
where
    F: FnOnce() -> flashsale::Result<String>,
{
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Response, StatusCode};

    match path {
        "/metrics" => match encode() {
            Ok(text) => {
                let mut response = Response::new(Full::new(Bytes::from(text)));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!("Metrics encoding failed: {}", e);
                let mut response = Response::new(Full::new(Bytes::from("error")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        },
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

async fn run_metrics_server(addr: &str, metrics: PipelineMetrics) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let response = metrics_response(req.uri().path(), || metrics.encode());
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::cell::Cell;

    #[test]
    fn test_metrics_route_only_encodes_on_metrics_path() {
        let calls = Cell::new(0);
        let encode = || {
            calls.set(calls.get() + 1);
            Ok::<_, flashsale::Error>("flashsale_up 1\n".to_string())
        };

        assert_eq!(metrics_response("/healthz", encode).status(), StatusCode::NOT_FOUND);
        assert_eq!(metrics_response("/", encode).status(), StatusCode::NOT_FOUND);
        assert_eq!(calls.get(), 0);

        let response = metrics_response("/metrics", encode);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_metrics_route_reports_encoding_failure() {
        let response = metrics_response("/metrics", || {
            Err(flashsale::Error::Internal("registry poisoned".into()))
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
