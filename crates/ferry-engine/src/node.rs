//! The node: one store, one environment, and the calls applications,
//! convergence layers and daemon tasks make against them.
//!
//! Every call is its own transaction. Nothing here holds the store across
//! an `.await`; waits happen on the volatile semaphores in between.

use std::sync::Arc;

use bytes::Bytes;
use ferry_core::config::FerryConfig;
use ferry_core::Priority;

use crate::acquire::AcqWorkArea;
use crate::bundle::BundleId;
use crate::clock::{Clock, SystemClock};
use crate::db::BpDb;
use crate::engine::{Engine, Env};
use crate::error::{EngineError, Result};
use crate::hooks::{CustodySignalAggregator, ExtensionHooks, Hooks};
use crate::plan::PlanStep;
use crate::routing::{Router, StaticRouter};
use crate::semaphore::{BpSemaphore, Wake};
use crate::send::SendRequest;
use crate::stats::Stats;
use crate::store::{Object, Sdr};
use crate::xmit::Outbound;
use crate::zco::{Residence, Zco};

/// A bundle handed to an application.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub bundle: Object,
    pub id: BundleId,
    /// `None` for anonymous bundles.
    pub source: Option<String>,
    pub admin: bool,
    pub content: Zco,
}

pub struct Node {
    sdr: Sdr<BpDb>,
    env: Env,
}

impl Node {
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Run `op` in one transaction. An error cancels everything it did.
    pub fn run<T>(&self, op: impl FnOnce(&mut Engine<'_>) -> Result<T>) -> Result<T> {
        let mut txn = self.sdr.begin()?;
        let out = op(&mut Engine::new(&mut txn, &self.env))?;
        txn.end();
        Ok(out)
    }

    pub fn stats(&self) -> Result<Stats> {
        self.run(|engine| Ok(engine.db.stats.get().clone()))
    }

    // ── Applications ──

    /// Originate a bundle, waiting for heap space for the payload.
    pub async fn send(&self, req: &SendRequest, payload: Bytes) -> Result<Option<Object>> {
        let len = payload.len() as u64;
        let lease = self
            .env
            .space
            .reserve(Residence::Heap, len)
            .await
            .ok_or(EngineError::InvalidSend("payload exceeds heap limit"))?;
        let content = Zco::from_heap(payload, Some(lease));
        self.run(|engine| engine.send(req, content))
    }

    pub fn open_endpoint(&self, eid: &str) -> Result<()> {
        let vep = self
            .env
            .vdb
            .endpoint(eid)
            .ok_or_else(|| EngineError::UnknownEndpoint(eid.to_string()))?;
        if vep.open.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::EndpointBusy(eid.to_string()));
        }
        vep.semaphore.unend();
        tracing::debug!(endpoint = eid, "endpoint opened");
        Ok(())
    }

    /// Stop holding an endpoint. A `receive` waiting on it returns `None`.
    pub fn close_endpoint(&self, eid: &str) -> Result<()> {
        let vep = self
            .env
            .vdb
            .endpoint(eid)
            .ok_or_else(|| EngineError::UnknownEndpoint(eid.to_string()))?;
        if !vep.open.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(EngineError::EndpointClosed(eid.to_string()));
        }
        vep.semaphore.end();
        tracing::debug!(endpoint = eid, "endpoint closed");
        Ok(())
    }

    /// Take the next bundle delivered to an open endpoint. With `wait`,
    /// blocks until one arrives or the endpoint is closed. A detained
    /// bundle stays stored until `release_delivery`.
    pub async fn receive(&self, eid: &str, wait: bool, detain: bool) -> Result<Option<Delivery>> {
        let vep = self
            .env
            .vdb
            .endpoint(eid)
            .ok_or_else(|| EngineError::UnknownEndpoint(eid.to_string()))?;
        if !vep.is_open() {
            return Err(EngineError::EndpointClosed(eid.to_string()));
        }
        loop {
            let delivery = self.run(|engine| {
                let Some(obj) = engine.take_delivery(eid)? else {
                    return Ok(None);
                };
                let bundle = engine.db.bundle(obj)?;
                let delivery = Delivery {
                    bundle: obj,
                    id: bundle.id.clone(),
                    source: bundle.source_eid().ok().filter(|s| s != ferry_core::eid::NULL_EID),
                    admin: bundle.flags.is_admin(),
                    content: bundle.payload.content.clone(),
                };
                if detain {
                    engine.db.bundle_mut(obj)?.detained = true;
                } else {
                    engine.destroy(obj, false)?;
                }
                Ok(Some(delivery))
            })?;
            if delivery.is_some() || !wait {
                return Ok(delivery);
            }
            if vep.semaphore.take().await == Wake::Ended {
                return Ok(None);
            }
        }
    }

    /// Let go of a detained bundle.
    pub fn release_delivery(&self, obj: Object) -> Result<()> {
        self.run(|engine| {
            let Some(bundle) = engine.db.bundles.stage(&obj) else {
                return Ok(());
            };
            bundle.detained = false;
            engine.destroy(obj, false)
        })
    }

    // ── Convergence layers ──

    /// Wait for the next bundle on a duct. `None` once the duct is ended.
    pub async fn bp_dequeue(&self, duct: &str) -> Result<Option<Outbound>> {
        let semaphore = self
            .env
            .vdb
            .ducts
            .get(duct)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::UnknownOutduct(duct.to_string()))?;
        loop {
            if let Some(out) = self.run(|engine| engine.dequeue(duct))? {
                return Ok(Some(out));
            }
            if semaphore.take().await == Wake::Ended {
                return Ok(None);
            }
        }
    }

    pub fn handle_xmit_success(&self, obj: Object) -> Result<bool> {
        self.run(|engine| engine.handle_xmit_success(obj))
    }

    pub fn handle_xmit_failure(&self, obj: Object) -> Result<bool> {
        self.run(|engine| engine.handle_xmit_failure(obj))
    }

    /// Start buffering one inbound transmission. `attendant` waits for
    /// ZCO space instead of refusing it.
    pub fn begin_acq(&self, sender: Option<String>, attendant: bool) -> AcqWorkArea {
        AcqWorkArea::new(
            self.env.space.clone(),
            self.env.max_acq_in_heap,
            self.env.work_dir.clone(),
            sender,
            attendant,
        )
    }

    /// Parse and admit everything acquired. Returns the bundles accepted.
    pub fn end_acq(&self, work: AcqWorkArea) -> Result<usize> {
        let (content, sender, congestive) = work.finish();
        self.run(|engine| engine.acquire(content, sender.as_deref(), congestive))
    }

    // ── Daemon tasks ──

    pub fn forwarder_step(&self, scheme: &str) -> Result<bool> {
        self.run(|engine| engine.forwarder_step(scheme))
    }

    pub fn transit_step(&self) -> Result<bool> {
        self.run(|engine| engine.transit_step())
    }

    pub fn plan_dequeue_step(&self, plan: &str) -> Result<PlanStep> {
        self.run(|engine| engine.plan_step(plan))
    }

    /// Fire every timeline event due by now. Returns how many fired.
    pub fn dispatch_events(&self) -> Result<usize> {
        self.run(|engine| {
            let now = engine.now().seconds;
            let mut fired = 0;
            while let Some((elt, event)) = engine.db.next_due_event(now) {
                engine.process_event(elt, event)?;
                fired += 1;
            }
            Ok(fired)
        })
    }

    pub fn replenish_throttles(&self) {
        self.env.vdb.replenish_throttles();
    }

    pub fn block_plan(&self, plan: &str) -> Result<()> {
        self.run(|engine| engine.block_plan(plan))
    }

    pub fn unblock_plan(&self, plan: &str) -> Result<()> {
        self.run(|engine| engine.unblock_plan(plan))
    }

    /// Bytes ahead of a new bundle of this class on a plan, and the
    /// plan's current backlog.
    pub fn prior_claims(&self, plan: &str, priority: Priority, ordinal: u8) -> Result<(u64, u64)> {
        self.run(|engine| engine.prior_claims(plan, priority, ordinal))
    }

    pub fn schemes(&self) -> Vec<String> {
        self.env.vdb.schemes.iter().map(|s| s.key().clone()).collect()
    }

    pub fn plans(&self) -> Vec<String> {
        self.env.vdb.plans.iter().map(|p| p.key().clone()).collect()
    }

    pub fn scheme_semaphore(&self, scheme: &str) -> Option<Arc<BpSemaphore>> {
        self.env.vdb.schemes.get(scheme).map(|s| s.value().clone())
    }

    pub fn plan_semaphore(&self, plan: &str) -> Option<Arc<BpSemaphore>> {
        self.env.vdb.plan(plan).map(|p| p.semaphore.clone())
    }

    pub fn transit_semaphore(&self) -> Arc<BpSemaphore> {
        self.env.vdb.transit.clone()
    }

    /// End every semaphore so that each waiting task returns.
    pub fn shutdown(&self) {
        tracing::info!("node shutting down");
        self.env.vdb.end_all();
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct NodeBuilder {
    config: FerryConfig,
    clock: Option<Arc<dyn Clock>>,
    router: Option<Box<dyn Router>>,
    extension: Option<Arc<dyn ExtensionHooks>>,
    aggregator: Option<Arc<dyn CustodySignalAggregator>>,
}

impl NodeBuilder {
    pub fn from_config(config: FerryConfig) -> Self {
        Self { config, clock: None, router: None, extension: None, aggregator: None }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the static router built from `routes`.
    pub fn with_router(mut self, router: Box<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_extension_hooks(mut self, hooks: Arc<dyn ExtensionHooks>) -> Self {
        self.extension = Some(hooks);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn CustodySignalAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn build(self) -> Result<Node> {
        let mut hooks = Hooks::from_config(&self.config.forwarding.hooks);
        if let Some(extension) = self.extension {
            hooks.extension = extension;
        }
        if let Some(aggregator) = self.aggregator {
            hooks.aggregator = aggregator;
        }
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let router = self
            .router
            .unwrap_or_else(|| Box::new(StaticRouter::new(&self.config.routes)));
        let env = Env::new(&self.config, clock, router, hooks);

        let sdr = Sdr::new(BpDb::new());
        {
            let mut txn = sdr.begin()?;
            Engine::new(&mut txn, &env).provision(&self.config)?;
            txn.end();
        }
        Ok(Node { sdr, env })
    }
}
