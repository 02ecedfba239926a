//! ferryd: DTN bundle-forwarding daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;

use ferry_core::config::FerryConfig;
use ferry_engine::NodeBuilder;

mod tasks;

/// Clock ticks between statistics reports.
const STATS_EVERY: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });
    tracing::info!(
        node = %config.node_eid(),
        schemes = config.schemes.len(),
        plans = config.plans.len(),
        routes = config.routes.len(),
        "ferryd starting"
    );

    std::fs::create_dir_all(&config.node.work_dir).with_context(|| {
        format!("failed to create work dir {}", config.node.work_dir.display())
    })?;
    let node = Arc::new(NodeBuilder::from_config(config).build().context("failed to build node")?);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let clock_task =
        tokio::spawn(tasks::Clock::new(node.clone(), STATS_EVERY, shutdown_tx.subscribe()).run());

    let transit_task = tokio::spawn(tasks::Transit::new(node.clone(), shutdown_tx.subscribe()).run());

    let mut workers = JoinSet::new();
    for scheme in node.schemes() {
        workers.spawn(tasks::Forwarder::new(node.clone(), scheme, shutdown_tx.subscribe()).run());
    }
    for plan in node.plans() {
        workers.spawn(tasks::PlanManager::new(node.clone(), plan, shutdown_tx.subscribe()).run());
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()       => tracing::info!("shutting down"),
        r = clock_task               => tracing::error!("clock task exited: {:?}", r),
        r = transit_task             => tracing::error!("transit task exited: {:?}", r),
        Some(r) = workers.join_next() => tracing::error!("worker exited: {:?}", r),
    }

    node.shutdown();
    if let Ok(stats) = node.stats() {
        stats.log();
    }
    Ok(())
}
