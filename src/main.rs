//! Feed harvester binary.
//! Loads config, wires collaborators, and hands the orchestrator to an interval trigger.
//!
//! `feed-harvester --once` runs a single cycle and prints the report as JSON.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_harvester::config::{AppConfig, LogFormat};
use feed_harvester::metrics::Metrics;
use feed_harvester::IntervalTrigger;

/// Process-wide subscriber, installed once before anything logs.
/// `RUST_LOG` wins over the configured filter.
fn init_tracing(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.filter.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    match cfg.logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "signal received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(signal = "ctrl-c", "signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cfg = AppConfig::load_default().context("loading harvester config")?;
    init_tracing(&cfg);

    let once = std::env::args().skip(1).any(|a| a == "--once");

    if let Some(listen) = cfg.metrics.listen.clone() {
        let metrics = Metrics::init()?;
        let router = metrics.router();
        tokio::spawn(async move {
            if let Err(e) = feed_harvester::metrics::serve(router, &listen).await {
                tracing::error!(error = %e, "metrics endpoint stopped");
            }
        });
    }

    let orchestrator = cfg.build_orchestrator().await?;
    tracing::info!(channels = ?orchestrator.channels(), "data collection started");

    if once {
        let cycle = orchestrator.run_cycle();
        tokio::pin!(cycle);
        let report = tokio::select! {
            report = &mut cycle => report,
            _ = shutdown_signal() => {
                // let the cycle stop between items and report what it got through
                orchestrator.shutdown();
                cycle.await
            }
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    orchestrator.start(IntervalTrigger::every(cfg.interval()))?;
    shutdown_signal().await;
    orchestrator.stop().await;
    tracing::info!("data collection stopped");
    Ok(())
}
