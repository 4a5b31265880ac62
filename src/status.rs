//! HTTP status endpoint: a plain-text metrics page for humans, a health
//! probe, and a small Prometheus gauge set for scrapers.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::Metrics;

struct Gauges {
    registry: Registry,
    tracked_flows: IntGauge,
    ended_flows: IntGauge,
    sampler_errors: IntGauge,
    samples_total: IntGauge,
    msg_bytes_total: IntGauge,
    churn_instantaneous: Gauge,
    churn_mean: Gauge,
}

impl Gauges {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        }

        fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
            let g = Gauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        }

        Ok(Self {
            tracked_flows: int_gauge(
                &registry,
                "flowmon_tracked_flows",
                "Flows currently in the tracker table",
            )?,
            ended_flows: int_gauge(
                &registry,
                "flowmon_ended_flows_total",
                "Flows ended since startup",
            )?,
            sampler_errors: int_gauge(
                &registry,
                "flowmon_sampler_errors_total",
                "Sampler errors since startup",
            )?,
            samples_total: int_gauge(
                &registry,
                "flowmon_samples_total",
                "Socket snapshots extracted since startup",
            )?,
            msg_bytes_total: int_gauge(
                &registry,
                "flowmon_reply_bytes_total",
                "Kernel reply bytes read since startup",
            )?,
            churn_instantaneous: gauge(
                &registry,
                "flowmon_churn_rate",
                "Instantaneous flow churn in flows per second",
            )?,
            churn_mean: gauge(
                &registry,
                "flowmon_churn_rate_mean",
                "Mean flow churn since startup in flows per second",
            )?,
            registry,
        })
    }

    fn update(&self, metrics: &Metrics) {
        let snap = metrics.snapshot();
        self.tracked_flows.set(snap.tracked_flows as i64);
        self.ended_flows.set(snap.ended_flows as i64);
        self.sampler_errors.set(snap.sampler_errors as i64);
        self.samples_total.set(snap.samples_total as i64);
        self.msg_bytes_total.set(snap.msg_bytes_total as i64);
        self.churn_instantaneous.set(snap.inst_churn_rate);
        self.churn_mean.set(metrics.churn_rate());
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
    gauges: Arc<Gauges>,
}

/// Serves the status endpoint until the token is cancelled.
pub async fn serve(addr: String, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    let state = AppState {
        metrics,
        gauges: Arc::new(Gauges::new()?),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding status server to {addr}"))?;
    info!(addr = %addr, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("status server")?;

    Ok(())
}

async fn root(State(state): State<AppState>) -> String {
    format!(
        "flowmon {}\n\n{}",
        env!("CARGO_PKG_VERSION"),
        state.metrics.render(),
    )
}

async fn healthz() -> &'static str {
    "OK"
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.gauges.update(&state.metrics);

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    match encoder.encode(&state.gauges.registry.gather(), &mut buf) {
        Ok(()) => (StatusCode::OK, String::from_utf8_lossy(&buf).into_owned()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        ),
    }
}
