//! Engine tasks. Each one wakes on its semaphore, drains its queue one
//! transaction at a time, and stops on shutdown or when the semaphore is
//! ended.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use ferry_engine::semaphore::{BpSemaphore, Wake};
use ferry_engine::{Node, PlanStep};

/// Wait for work. False means stop.
async fn wait(semaphore: &BpSemaphore, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.recv() => false,
        wake = semaphore.take() => wake == Wake::Work,
    }
}

// ── Clock ────────────────────────────────────────────────────────────────────

/// Fires due timeline events and refills plan throttles once a second.
pub struct Clock {
    node: Arc<Node>,
    /// Log statistics every this many ticks. 0 = never.
    stats_every: u64,
    shutdown: broadcast::Receiver<()>,
}

impl Clock {
    pub fn new(node: Arc<Node>, stats_every: u64, shutdown: broadcast::Receiver<()>) -> Self {
        Self { node, stats_every, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("clock shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    let fired = self.node.dispatch_events().context("timeline dispatch failed")?;
                    if fired > 0 {
                        tracing::debug!(fired, "timeline events processed");
                    }
                    self.node.replenish_throttles();
                    ticks += 1;
                    if self.stats_every > 0 && ticks % self.stats_every == 0 {
                        self.node.stats()?.log();
                    }
                }
            }
        }
    }
}

// ── Transit ──────────────────────────────────────────────────────────────────

/// Sends bundles passing through this node on toward their destinations.
pub struct Transit {
    node: Arc<Node>,
    shutdown: broadcast::Receiver<()>,
}

impl Transit {
    pub fn new(node: Arc<Node>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { node, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        let semaphore = self.node.transit_semaphore();
        loop {
            while self.node.transit_step().context("transit step failed")? {}
            if !wait(&semaphore, &mut self.shutdown).await {
                tracing::info!("transit shutting down");
                return Ok(());
            }
        }
    }
}

// ── Forwarder ────────────────────────────────────────────────────────────────

/// Routes every bundle on one scheme's forward queue.
pub struct Forwarder {
    node: Arc<Node>,
    scheme: String,
    shutdown: broadcast::Receiver<()>,
}

impl Forwarder {
    pub fn new(node: Arc<Node>, scheme: String, shutdown: broadcast::Receiver<()>) -> Self {
        Self { node, scheme, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        let semaphore = self
            .node
            .scheme_semaphore(&self.scheme)
            .with_context(|| format!("no semaphore for scheme {}", self.scheme))?;
        tracing::info!(scheme = %self.scheme, "forwarder started");
        loop {
            while self
                .node
                .forwarder_step(&self.scheme)
                .with_context(|| format!("forwarder for {} failed", self.scheme))?
            {}
            if !wait(&semaphore, &mut self.shutdown).await {
                tracing::info!(scheme = %self.scheme, "forwarder shutting down");
                return Ok(());
            }
        }
    }
}

// ── Plan manager ─────────────────────────────────────────────────────────────

/// Moves bundles from one plan's queues to its outduct.
pub struct PlanManager {
    node: Arc<Node>,
    plan: String,
    shutdown: broadcast::Receiver<()>,
}

impl PlanManager {
    pub fn new(node: Arc<Node>, plan: String, shutdown: broadcast::Receiver<()>) -> Self {
        Self { node, plan, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        let semaphore = self
            .node
            .plan_semaphore(&self.plan)
            .with_context(|| format!("no semaphore for plan {}", self.plan))?;
        tracing::info!(plan = %self.plan, "plan manager started");
        loop {
            loop {
                let step = self
                    .node
                    .plan_dequeue_step(&self.plan)
                    .with_context(|| format!("plan manager for {} failed", self.plan))?;
                match step {
                    PlanStep::Moved(bundle) => {
                        tracing::trace!(plan = %self.plan, %bundle, "bundle handed to outduct");
                    }
                    PlanStep::Parked => {}
                    PlanStep::Idle | PlanStep::Throttled => break,
                }
            }
            if !wait(&semaphore, &mut self.shutdown).await {
                tracing::info!(plan = %self.plan, "plan manager shutting down");
                return Ok(());
            }
        }
    }
}
