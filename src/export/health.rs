use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "flowtally";

/// Prometheus metrics for the capture pipeline.
///
/// All metrics use the "flowtally" namespace. The metrics are always
/// registered and updated; the HTTP server that exposes them only runs when
/// enabled in configuration.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Packets handed to the sink.
    pub packets_received: Counter,
    /// Packets recorded under the unknown flow.
    pub packets_unclassified: Counter,
    /// Flushes run against an open bucket file.
    pub flushes: Counter,
    /// Flushes that failed after exhausting retries.
    pub flush_errors: Counter,
    /// Rows appended to bucket files.
    pub rows_written: Counter,
    /// Bucket files opened.
    pub bucket_rotations: Counter,
    /// Summary reports generated.
    pub summaries: Counter,
    /// Distinct flows currently held in the aggregation cache.
    pub cache_entries: Gauge,
    /// Wall time of each flush.
    pub flush_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let packets_received = Counter::with_opts(
            Opts::new("packets_received_total", "Packets handed to the sink.")
                .namespace(NAMESPACE),
        )?;
        let packets_unclassified = Counter::with_opts(
            Opts::new(
                "packets_unclassified_total",
                "Packets recorded under the unknown flow.",
            )
            .namespace(NAMESPACE),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Flushes run against an open bucket file.")
                .namespace(NAMESPACE),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new(
                "flush_errors_total",
                "Flushes that failed after exhausting retries.",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_written = Counter::with_opts(
            Opts::new("rows_written_total", "Rows appended to bucket files.")
                .namespace(NAMESPACE),
        )?;
        let bucket_rotations = Counter::with_opts(
            Opts::new("bucket_rotations_total", "Bucket files opened.").namespace(NAMESPACE),
        )?;
        let summaries = Counter::with_opts(
            Opts::new("summaries_total", "Summary reports generated.").namespace(NAMESPACE),
        )?;
        let cache_entries = Gauge::with_opts(
            Opts::new(
                "cache_entries",
                "Distinct flows currently held in the aggregation cache.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flush_duration_seconds", "Wall time of each flush.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(packets_unclassified.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(bucket_rotations.clone()))?;
        registry.register(Box::new(summaries.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            packets_received,
            packets_unclassified,
            flushes,
            flush_errors,
            rows_written,
            bucket_rotations,
            summaries,
            cache_entries,
            flush_duration,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
