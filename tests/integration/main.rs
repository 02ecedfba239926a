//! ferry integration test harness.
//!
//! Each test builds a small network of nodes in one process. Nodes share a
//! manual clock per test and exchange bundles by dequeuing from one node's
//! duct and acquiring the bytes on the next, which stands in for a
//! convergence layer.
//!
//!   cargo test --test integration

use std::sync::Arc;

use anyhow::{Context, Result};
use ferry_core::config::{
    EndpointConfig, FerryConfig, PlanConfig, RecvRule, RouteConfig, SchemeConfig,
};
use ferry_engine::{ManualClock, Node, NodeBuilder, Outbound, PlanStep, SendRequest};

mod acquisition;
mod custody;
mod fragmentation;
mod lifecycle;
mod queueing;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const START: u64 = 50_000;

/// Node `n` with application endpoint `ipn:n.1`.
pub fn config(n: u64) -> FerryConfig {
    let mut cfg = FerryConfig::default();
    cfg.node.node_number = n;
    cfg.node.work_dir =
        std::env::temp_dir().join(format!("ferry-it-{}-{n}", std::process::id()));
    cfg.schemes = vec![SchemeConfig {
        name: "ipn".into(),
        endpoints: vec![EndpointConfig {
            nss: format!("{n}.1"),
            recv_rule: RecvRule::Enqueue,
            script: None,
        }],
    }];
    cfg
}

/// A plan to node `to` over duct `tcp/{to}`.
pub fn plan(to: u64) -> PlanConfig {
    PlanConfig {
        neighbor: format!("ipn:{to}.0"),
        nominal_rate: 0,
        max_payload_len: 0,
        outducts: vec![format!("tcp/{to}")],
    }
}

pub fn route(destination: &str, via: &str) -> RouteConfig {
    RouteConfig { destination: destination.into(), via: via.into() }
}

pub fn build(cfg: FerryConfig, clock: &Arc<ManualClock>) -> Arc<Node> {
    Arc::new(
        NodeBuilder::from_config(cfg)
            .with_clock(clock.clone())
            .build()
            .expect("node builds"),
    )
}

/// Node 1 and node 2 with a plan each way.
pub fn pair() -> (Arc<Node>, Arc<Node>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let mut a = config(1);
    a.plans = vec![plan(2)];
    let mut b = config(2);
    b.plans = vec![plan(1)];
    (build(a, &clock), build(b, &clock), clock)
}

pub fn request(from: &str, to: &str) -> SendRequest {
    SendRequest::new(from, to, 3600)
}

pub async fn send(node: &Node, req: &SendRequest, payload: &[u8]) -> Result<()> {
    node.send(req, bytes::Bytes::copy_from_slice(payload))
        .await?
        .context("bundle was dropped at origination")?;
    Ok(())
}

/// Run every forwarder and the transit queue until nothing moves.
pub fn drain(node: &Node) -> Result<()> {
    loop {
        let mut busy = false;
        for scheme in node.schemes() {
            while node.forwarder_step(&scheme)? {
                busy = true;
            }
        }
        while node.transit_step()? {
            busy = true;
        }
        if !busy {
            return Ok(());
        }
    }
}

/// Move everything the plan manager will move right now.
pub fn pump(node: &Node, plan: &str) -> Result<Vec<PlanStep>> {
    let mut steps = Vec::new();
    loop {
        match node.plan_dequeue_step(plan)? {
            PlanStep::Idle | PlanStep::Throttled => return Ok(steps),
            step => steps.push(step),
        }
    }
}

/// Everything waiting on a duct, without blocking.
pub fn take_outbound(node: &Node, duct: &str) -> Result<Vec<Outbound>> {
    let mut out = Vec::new();
    while let Some(bundle) = node.run(|engine| engine.dequeue(duct))? {
        out.push(bundle);
    }
    Ok(out)
}

/// Acquire one transmission on `node`. Returns the bundles accepted.
pub async fn acquire(node: &Node, sender: &str, bytes: &[u8]) -> Result<usize> {
    let mut work = node.begin_acq(Some(sender.to_string()), false);
    work.continue_acq(bytes).await?;
    Ok(node.end_acq(work)?)
}

/// Carry every bundle from `from`'s duct toward node `to_node` into `to`,
/// reporting each transmission as sent. Returns the bundles carried.
pub async fn relay(from: &Node, to: &Node, to_node: u64) -> Result<usize> {
    let plan = format!("ipn:{to_node}.0");
    drain(from)?;
    pump(from, &plan)?;
    let outbound = take_outbound(from, &format!("tcp/{to_node}"))?;
    let sender = from.env().custodian_eid.clone();
    for bundle in &outbound {
        acquire(to, &sender, &bundle.bytes).await?;
        from.handle_xmit_success(bundle.bundle)?;
    }
    drain(to)?;
    Ok(outbound.len())
}

/// Every payload waiting at an endpoint, oldest first.
pub async fn received(node: &Node, eid: &str) -> Result<Vec<Vec<u8>>> {
    node.open_endpoint(eid)?;
    let mut payloads = Vec::new();
    while let Some(delivery) = node.receive(eid, false, false).await? {
        payloads.push(delivery.content.read()?.to_vec());
    }
    node.close_endpoint(eid)?;
    Ok(payloads)
}
