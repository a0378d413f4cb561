// src/metrics.rs
//! Prometheus exposition for the binary. The collection core only emits
//! through the `metrics` facade; this is the optional outer wrapper.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder. Call once at startup.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        crate::collect::ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Router exposing `/metrics` (Prometheus text format) and `/health`.
    pub fn router(&self) -> Router {
        router(self.handle.clone())
    }
}

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
}

/// Serve the router on `listen` until the process exits.
pub async fn serve(router: Router, listen: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding metrics listener on {listen}"))?;
    tracing::info!(listen, "metrics endpoint up");
    axum::serve(listener, router)
        .await
        .context("metrics server")?;
    Ok(())
}
