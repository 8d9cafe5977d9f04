//! HTTP routes for health checks and Prometheus scraping.

use anyhow::{Context, Result};
use axum::{extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse};
use axum::{body::Body, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::time::Instant;

// seconds, tuned for poll and commit latencies
const BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Health routes plus `/metrics`.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(|| async { "kafka record consumer" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(|| async { "ok" }))
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(track_http_metrics))
}

pub async fn serve(router: Router, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind metrics server to {bind}"))?;
    axum::serve(listener, router)
        .await
        .context("Metrics server failed")
}

async fn track_http_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let response = next.run(req).await;

    let labels = [
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
