use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "dsmr";

/// Prometheus metrics for collector health and observability.
///
/// All metrics use the "dsmr" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Bus ===
    /// Total publishes received on subscribed topics.
    pub messages_received: Counter,
    /// Connection state (0=disconnected, 1=connecting, 2=connected).
    pub connection_state: Gauge,
    /// Total reconnect attempts after a lost connection.
    pub reconnect_attempts: Counter,
    /// Heartbeat publishes by outcome (ok/failed).
    pub heartbeats: CounterVec,

    // === Aggregation ===
    /// Field updates applied to the current record.
    pub updates_applied: Counter,
    /// Updates for subtopics not in the registry.
    pub updates_ignored: Counter,
    /// Updates dropped by reason (malformed/queue_full).
    pub updates_dropped: CounterVec,
    /// Fields set in the current record.
    pub fields_pending: Gauge,
    /// Records flushed by reason (completed/timed_out/shutdown).
    pub records_flushed: CounterVec,
    /// Records dropped before reaching the store.
    pub records_dropped: Counter,

    // === Storage ===
    /// Records written successfully.
    pub records_stored: Counter,
    /// Failed writes by store.
    pub store_errors: CounterVec,
    /// Write duration by store.
    pub store_duration: HistogramVec,
    /// Whether the store connection is up (1=yes, 0=no).
    pub store_connected: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_received = Counter::with_opts(
            Opts::new(
                "messages_received_total",
                "Total publishes received on subscribed topics.",
            )
            .namespace(NAMESPACE),
        )?;
        let connection_state = Gauge::with_opts(
            Opts::new(
                "connection_state",
                "Broker connection state (0=disconnected, 1=connecting, 2=connected).",
            )
            .namespace(NAMESPACE),
        )?;
        let reconnect_attempts = Counter::with_opts(
            Opts::new(
                "reconnect_attempts_total",
                "Total reconnect attempts after a lost connection.",
            )
            .namespace(NAMESPACE),
        )?;
        let heartbeats = CounterVec::new(
            Opts::new("heartbeats_total", "Heartbeat publishes by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;

        let updates_applied = Counter::with_opts(
            Opts::new(
                "updates_applied_total",
                "Field updates applied to the current record.",
            )
            .namespace(NAMESPACE),
        )?;
        let updates_ignored = Counter::with_opts(
            Opts::new(
                "updates_ignored_total",
                "Updates for subtopics not in the field registry.",
            )
            .namespace(NAMESPACE),
        )?;
        let updates_dropped = CounterVec::new(
            Opts::new("updates_dropped_total", "Updates dropped by reason.").namespace(NAMESPACE),
            &["reason"],
        )?;
        let fields_pending = Gauge::with_opts(
            Opts::new("fields_pending", "Fields set in the current record.").namespace(NAMESPACE),
        )?;
        let records_flushed = CounterVec::new(
            Opts::new("records_flushed_total", "Records flushed by reason.").namespace(NAMESPACE),
            &["reason"],
        )?;
        let records_dropped = Counter::with_opts(
            Opts::new(
                "records_dropped_total",
                "Records dropped because the persist queue was full.",
            )
            .namespace(NAMESPACE),
        )?;

        let records_stored = Counter::with_opts(
            Opts::new("records_stored_total", "Records written successfully.")
                .namespace(NAMESPACE),
        )?;
        let store_errors = CounterVec::new(
            Opts::new("store_errors_total", "Failed record writes by store.").namespace(NAMESPACE),
            &["store"],
        )?;
        let store_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_duration_seconds",
                "Time to write a single record by store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["store"],
        )?;
        let store_connected = GaugeVec::new(
            Opts::new(
                "store_connected",
                "Whether the store connection is established (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["store"],
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(updates_applied.clone()))?;
        registry.register(Box::new(updates_ignored.clone()))?;
        registry.register(Box::new(updates_dropped.clone()))?;
        registry.register(Box::new(fields_pending.clone()))?;
        registry.register(Box::new(records_flushed.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(records_stored.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_duration.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_received,
            connection_state,
            reconnect_attempts,
            heartbeats,
            updates_applied,
            updates_ignored,
            updates_dropped,
            fields_pending,
            records_flushed,
            records_dropped,
            records_stored,
            store_errors,
            store_duration,
            store_connected,
        })
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_metrics(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
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

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_metrics(&state.registry) {
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

fn encode_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics register");
        health.messages_received.inc();
        health
            .records_flushed
            .with_label_values(&["completed"])
            .inc();

        let text = health.render().expect("renders");
        assert!(text.contains("dsmr_messages_received_total 1"));
        assert!(text.contains("dsmr_records_flushed_total{reason=\"completed\"} 1"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_metrics() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics register");
        health.updates_applied.inc_by(3.0);
        let addr = health.start().await.expect("server starts");

        let healthz = http_get(addr, "/healthz").await;
        assert!(healthz.starts_with("HTTP/1.1 200"));
        assert!(healthz.ends_with("ok"));

        let metrics = http_get(addr, "/metrics").await;
        assert!(metrics.contains("dsmr_updates_applied_total 3"));

        health.stop().await.expect("stops");
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr)
            .await
            .expect("connects");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .expect("writes request");

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("reads response");
        response
    }
}
