use std::sync::Arc;

use ferry_core::config::FerryConfig;
use ferry_engine::{DelReason, ManualClock, Node, Residence, StateStat};

use crate::*;

/// What node 1 puts on its duct to node 2 for one bundle.
async fn wire_bundle(a: &Node, custody: bool, payload: &[u8]) -> Vec<u8> {
    let mut req = request("ipn:1.1", "ipn:2.1");
    req.custody = custody;
    send(a, &req, payload).await.unwrap();
    drain(a).unwrap();
    pump(a, "ipn:2.0").unwrap();
    let mut out = take_outbound(a, "tcp/2").unwrap();
    assert_eq!(out.len(), 1);
    a.handle_xmit_success(out[0].bundle).unwrap();
    out.remove(0).bytes.to_vec()
}

fn pair_with(b: FerryConfig) -> (Arc<Node>, Arc<Node>) {
    let clock = Arc::new(ManualClock::new(START));
    let mut a = config(1);
    a.plans = vec![plan(2)];
    (build(a, &clock), build(b, &clock))
}

fn node_two() -> FerryConfig {
    let mut cfg = config(2);
    cfg.plans = vec![plan(1)];
    cfg
}

#[tokio::test]
async fn large_transmission_spills_to_file() {
    let mut cfg = node_two();
    cfg.node.max_acq_in_heap = 16;
    let (a, b) = pair_with(cfg);
    let payload: Vec<u8> = (0..200u8).collect();
    let wire = wire_bundle(&a, false, &payload).await;

    let mut work = b.begin_acq(Some("ipn:1.0".into()), false);
    for chunk in wire.chunks(10) {
        work.continue_acq(chunk).await.unwrap();
    }
    assert_eq!(b.env().space.occupancy(Residence::Heap), 10);
    assert!(b.env().space.occupancy(Residence::File) > 0);
    assert_eq!(b.end_acq(work).unwrap(), 1);
    drain(&b).unwrap();

    assert_eq!(received(&b, "ipn:2.1").await.unwrap(), vec![payload]);
    assert_eq!(b.env().space.occupancy(Residence::File), 0);
}

#[tokio::test]
async fn congestion_refuses_custody_upstream() {
    let clock = Arc::new(ManualClock::new(START));
    let mut c1 = config(1);
    c1.plans = vec![plan(2)];
    let a = build(c1, &clock);
    let wire = wire_bundle(&a, true, b"no room for this").await;

    let mut c2 = node_two();
    c2.node.heap_limit = wire.len() as u64 + 200;
    c2.node.file_limit = 0;
    let b = build(c2, &clock);

    let mut work = b.begin_acq(Some("ipn:1.0".into()), false);
    work.continue_acq(&wire).await.unwrap();
    work.continue_acq(&[0u8; 300]).await.unwrap();
    assert!(work.is_congestive());
    assert_eq!(b.end_acq(work).unwrap(), 0);
    assert_eq!(b.stats().unwrap().deleted(DelReason::Depleted).count, 1);

    assert_eq!(relay(&b, &a, 1).await.unwrap(), 1);
    let stats = a.stats().unwrap();
    assert_eq!(stats.total(StateStat::CustodyRefused).count, 1);
    assert!(a.env().vdb.is_snubbed(2, 2));
}

#[tokio::test]
async fn duplicate_of_a_held_bundle_counts_as_delivered_custody() {
    let clock = Arc::new(ManualClock::new(START));
    let mut c1 = config(1);
    c1.plans = vec![plan(2)];
    c1.routes = vec![route("ipn:3.*", "ipn:2.0")];
    let mut c2 = config(2);
    c2.plans = vec![plan(1), plan(3)];
    let (a, b) = (build(c1, &clock), build(c2, &clock));

    let mut req = request("ipn:1.1", "ipn:3.1");
    req.custody = true;
    send(&a, &req, b"onward").await.unwrap();
    drain(&a).unwrap();
    pump(&a, "ipn:2.0").unwrap();
    let out = take_outbound(&a, "tcp/2").unwrap();
    a.handle_xmit_success(out[0].bundle).unwrap();

    assert_eq!(acquire(&b, "ipn:1.0", &out[0].bytes).await.unwrap(), 1);
    drain(&b).unwrap();
    assert_eq!(acquire(&b, "ipn:1.0", &out[0].bytes).await.unwrap(), 0);

    // Custody acceptance, then the redundant-reception refusal.
    assert_eq!(relay(&b, &a, 1).await.unwrap(), 2);
    let sa = a.stats().unwrap();
    assert_eq!(sa.current.count, 0);
    assert_eq!(sa.total(StateStat::CustodyReleased).count, 1);
    assert_eq!(sa.total(StateStat::CustodyRefused).count, 0);

    let sb = b.stats().unwrap();
    assert_eq!(sb.current.count, 1);
    assert_eq!(sb.total(StateStat::CustodyAccepted).count, 1);
}

#[tokio::test]
async fn expired_arrival_is_dropped() {
    let (a, b) = pair_with(node_two());
    let wire = wire_bundle(&a, false, b"stale").await;

    let clock_b = Arc::new(ManualClock::new(START + 3600));
    let late = build(node_two(), &clock_b);
    assert_eq!(acquire(&late, "ipn:1.0", &wire).await.unwrap(), 0);
    let stats = late.stats().unwrap();
    assert_eq!(stats.current.count, 0);
    assert_eq!(stats.deleted(DelReason::Expired).count, 1);

    assert_eq!(acquire(&b, "ipn:1.0", &wire).await.unwrap(), 1);
}
