//! Daemon self-observability: `/healthz` plus Prometheus `/metrics`.
//!
//! This surfaces the engine's guardrail counters for operators; it is
//! separate from the metric reports the engine produces for its configs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::stats::GuardrailStats;

/// Prometheus gauges mirroring the guardrail counters, refreshed by a
/// background task.
pub struct HealthServer {
    registry: Registry,
    addr: String,
    stats: Arc<GuardrailStats>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    event_parse_failures: Gauge,
    matcher_errors: Gauge,
    dimension_overflows: Gauge,
    uid_map_records_dropped: Gauge,
    uid_map_bytes: Gauge,
    uid_map_changes: Gauge,
    pull_failures: Gauge,
    samples_absent: Gauge,
}

impl HealthServer {
    pub fn new(addr: &str, stats: Arc<GuardrailStats>) -> Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            Ok(Gauge::with_opts(
                Opts::new(name, help).namespace("metricsd"),
            )?)
        };

        let event_parse_failures = gauge(
            "event_parse_failures_total",
            "Events rejected by the wire decoder.",
        )?;
        let matcher_errors = gauge(
            "matcher_errors_total",
            "Matcher evaluations that hit an unsupported construct.",
        )?;
        let dimension_overflows = gauge(
            "dimension_overflows_total",
            "Dimension keys folded into overflow buckets.",
        )?;
        let uid_map_records_dropped = gauge(
            "uid_map_records_dropped_total",
            "Change records evicted to honor the uid map byte budget.",
        )?;
        let uid_map_bytes = gauge("uid_map_bytes", "Live uid map memory estimate.")?;
        let uid_map_changes = gauge("uid_map_changes", "Live uid map change-record count.")?;
        let pull_failures = gauge(
            "pull_failures_total",
            "Puller invocations that failed or timed out.",
        )?;
        let samples_absent = gauge(
            "samples_absent_total",
            "Gauge/value samples marked absent.",
        )?;

        registry.register(Box::new(event_parse_failures.clone()))?;
        registry.register(Box::new(matcher_errors.clone()))?;
        registry.register(Box::new(dimension_overflows.clone()))?;
        registry.register(Box::new(uid_map_records_dropped.clone()))?;
        registry.register(Box::new(uid_map_bytes.clone()))?;
        registry.register(Box::new(uid_map_changes.clone()))?;
        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(samples_absent.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            stats,
            shutdown: parking_lot::Mutex::new(None),
            event_parse_failures,
            matcher_errors,
            dimension_overflows,
            uid_map_records_dropped,
            uid_map_bytes,
            uid_map_changes,
            pull_failures,
            samples_absent,
        })
    }

    /// Copies the current guardrail snapshot into the gauges.
    pub fn refresh(&self) {
        let snap = self.stats.snapshot();
        self.event_parse_failures
            .set(snap.event_parse_failures as f64);
        self.matcher_errors.set(snap.matcher_errors as f64);
        self.dimension_overflows
            .set(snap.dimension_overflows as f64);
        self.uid_map_records_dropped
            .set(snap.uid_map_records_dropped as f64);
        self.uid_map_bytes.set(snap.uid_map_bytes as f64);
        self.uid_map_changes.set(snap.uid_map_changes as f64);
        self.pull_failures.set(snap.pull_failures as f64);
        self.samples_absent.set(snap.samples_absent as f64);
    }

    /// Starts the HTTP server and the gauge refresh loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let app_state = Arc::clone(self);
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let refresher = Arc::clone(self);
        let refresh_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = refresh_cancel.cancelled() => break,
                    _ = interval.tick() => refresher.refresh(),
                }
            }
        });

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server started");
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts the server down.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<HealthServer>>) -> impl IntoResponse {
    state.refresh();
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }
    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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
