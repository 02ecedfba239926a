use std::sync::Arc;

use ferry_core::config::{FerryConfig, PriorClaims};
use ferry_core::Priority;
use ferry_engine::{ManualClock, Node, PlanStep};

use crate::*;

fn pair_with(a: FerryConfig) -> (Arc<Node>, Arc<Node>) {
    let clock = Arc::new(ManualClock::new(START));
    let mut b = config(2);
    b.plans = vec![plan(1)];
    (build(a, &clock), build(b, &clock))
}

fn node_one() -> FerryConfig {
    let mut cfg = config(1);
    cfg.plans = vec![plan(2)];
    cfg
}

async fn send_class(node: &Node, priority: Priority, ordinal: u8, payload: &[u8]) {
    let mut req = request("ipn:1.1", "ipn:2.1");
    req.priority = priority;
    req.ordinal = ordinal;
    send(node, &req, payload).await.unwrap();
}

fn text(payloads: Vec<Vec<u8>>) -> Vec<String> {
    payloads.into_iter().map(|p| String::from_utf8(p).unwrap()).collect()
}

#[tokio::test]
async fn urgent_goes_first() {
    let (a, b) = pair_with(node_one());
    send_class(&a, Priority::Bulk, 0, b"bulk").await;
    send_class(&a, Priority::Standard, 0, b"std").await;
    send_class(&a, Priority::Urgent, 0, b"urgent").await;

    relay(&a, &b, 2).await.unwrap();
    assert_eq!(text(received(&b, "ipn:2.1").await.unwrap()), vec!["urgent", "std", "bulk"]);
}

#[tokio::test]
async fn higher_ordinals_overtake_lower_ones() {
    let (a, b) = pair_with(node_one());
    send_class(&a, Priority::Urgent, 3, b"three").await;
    send_class(&a, Priority::Urgent, 200, b"two hundred").await;
    send_class(&a, Priority::Urgent, 50, b"fifty").await;
    send_class(&a, Priority::Urgent, 200, b"two hundred again").await;

    relay(&a, &b, 2).await.unwrap();
    assert_eq!(
        text(received(&b, "ipn:2.1").await.unwrap()),
        vec!["two hundred", "two hundred again", "fifty", "three"]
    );
}

#[tokio::test]
async fn strict_priority_drains_standard_before_bulk() {
    let mut cfg = node_one();
    cfg.forwarding.prior_claims = PriorClaims::Standard;
    let (a, b) = pair_with(cfg);
    for i in 0..3 {
        send_class(&a, Priority::Bulk, 0, format!("b{i}").as_bytes()).await;
        send_class(&a, Priority::Standard, 0, format!("s{i}").as_bytes()).await;
    }

    relay(&a, &b, 2).await.unwrap();
    assert_eq!(
        text(received(&b, "ipn:2.1").await.unwrap()),
        vec!["s0", "s1", "s2", "b0", "b1", "b2"]
    );
}

#[tokio::test]
async fn reserved_bandwidth_interleaves_bulk() {
    let mut cfg = node_one();
    cfg.forwarding.prior_claims = PriorClaims::BandwidthReserved;
    let (a, b) = pair_with(cfg);
    for i in 0..4 {
        send_class(&a, Priority::Bulk, 0, format!("b{i}").as_bytes()).await;
        send_class(&a, Priority::Standard, 0, format!("s{i}").as_bytes()).await;
    }

    relay(&a, &b, 2).await.unwrap();
    assert_eq!(
        text(received(&b, "ipn:2.1").await.unwrap()),
        vec!["s0", "b0", "s1", "s2", "b1", "s3", "b2", "b3"]
    );
}

#[tokio::test]
async fn throttle_holds_back_the_next_bundle() {
    let mut cfg = node_one();
    cfg.plans[0].nominal_rate = 1000;
    let (a, _) = pair_with(cfg);
    let payload = vec![7u8; 1500];
    send_class(&a, Priority::Standard, 0, &payload).await;
    send_class(&a, Priority::Standard, 0, &payload).await;
    drain(&a).unwrap();

    assert_eq!(pump(&a, "ipn:2.0").unwrap().len(), 1);
    assert_eq!(a.plan_dequeue_step("ipn:2.0").unwrap(), PlanStep::Throttled);
    let (_, backlog) = a.prior_claims("ipn:2.0", Priority::Standard, 0).unwrap();
    assert!(backlog > 1500 + 1000);

    a.replenish_throttles();
    assert_eq!(pump(&a, "ipn:2.0").unwrap().len(), 1);
    assert_eq!(take_outbound(&a, "tcp/2").unwrap().len(), 2);
}

#[tokio::test]
async fn blocked_plan_parks_bundles_until_unblocked() {
    let (a, b) = pair_with(node_one());
    send_class(&a, Priority::Standard, 0, b"queued first").await;
    drain(&a).unwrap();

    a.block_plan("ipn:2.0").unwrap();
    send_class(&a, Priority::Standard, 0, b"queued while blocked").await;
    drain(&a).unwrap();
    assert!(pump(&a, "ipn:2.0").unwrap().is_empty());
    assert_eq!(a.stats().unwrap().to_limbo, 2);

    a.unblock_plan("ipn:2.0").unwrap();
    assert_eq!(relay(&a, &b, 2).await.unwrap(), 2);
    assert_eq!(
        text(received(&b, "ipn:2.1").await.unwrap()),
        vec!["queued first", "queued while blocked"]
    );
    assert_eq!(a.stats().unwrap().from_limbo, 2);
}
