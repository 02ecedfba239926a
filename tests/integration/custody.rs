use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ferry_core::admin::CustodySignal;
use ferry_engine::bundle::Bundle;
use ferry_engine::{
    CustodySignalAggregator, DelReason, ExtensionHooks, ManualClock, NodeBuilder, StateStat,
};

use crate::*;

fn custodial(from: &str, to: &str) -> ferry_engine::SendRequest {
    let mut req = request(from, to);
    req.custody = true;
    req
}

#[tokio::test]
async fn downstream_signal_releases_custody() {
    let (a, b, _) = pair();
    send(&a, &custodial("ipn:1.1", "ipn:2.1"), b"in my care").await.unwrap();

    relay(&a, &b, 2).await.unwrap();
    let held = a.stats().unwrap();
    assert_eq!(held.current.count, 1);
    assert_eq!(held.total(StateStat::CustodyAccepted).count, 1);

    assert_eq!(relay(&b, &a, 1).await.unwrap(), 1);
    let released = a.stats().unwrap();
    assert_eq!(released.current.count, 0);
    assert_eq!(released.total(StateStat::CustodyReleased).count, 1);
    assert_eq!(released.deleted(DelReason::Forwarded).count, 0);
    assert_eq!(received(&b, "ipn:2.1").await.unwrap(), vec![b"in my care".to_vec()]);
}

#[tokio::test]
async fn missing_signal_triggers_retransmission() {
    let clock = Arc::new(ManualClock::new(START));
    let mut cfg = config(1);
    cfg.plans = vec![plan(2)];
    cfg.forwarding.custody_timeout_secs = 20;
    let a = build(cfg, &clock);

    send(&a, &custodial("ipn:1.1", "ipn:2.1"), b"again").await.unwrap();
    drain(&a).unwrap();
    pump(&a, "ipn:2.0").unwrap();
    let first = take_outbound(&a, "tcp/2").unwrap();
    assert_eq!(first.len(), 1);
    a.handle_xmit_success(first[0].bundle).unwrap();

    clock.advance(19);
    assert_eq!(a.dispatch_events().unwrap(), 0);
    clock.advance(1);
    assert_eq!(a.dispatch_events().unwrap(), 1);

    drain(&a).unwrap();
    pump(&a, "ipn:2.0").unwrap();
    let second = take_outbound(&a, "tcp/2").unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, first[0].id);
}

#[tokio::test]
async fn refusal_snubs_the_neighbor() {
    let clock = Arc::new(ManualClock::new(START));
    let mut c1 = config(1);
    c1.plans = vec![plan(2)];
    c1.routes = vec![route("ipn:3.*", "ipn:2.0")];
    let mut c2 = config(2);
    c2.plans = vec![plan(1)];
    let (a, b) = (build(c1, &clock), build(c2, &clock));

    send(&a, &custodial("ipn:1.1", "ipn:3.1"), b"dead end").await.unwrap();
    relay(&a, &b, 2).await.unwrap();
    assert_eq!(b.stats().unwrap().deleted(DelReason::NoRoute).count, 1);

    assert_eq!(relay(&b, &a, 1).await.unwrap(), 1);
    assert!(a.env().vdb.is_snubbed(3, 2));
    drain(&a).unwrap();

    let stats = a.stats().unwrap();
    assert_eq!(stats.total(StateStat::CustodyRefused).count, 1);
    assert_eq!(stats.deleted(DelReason::NoRoute).count, 1);
    assert_eq!(stats.current.count, 0);
}

#[derive(Default)]
struct Aggregate {
    absorbed: AtomicUsize,
}

impl CustodySignalAggregator for Aggregate {
    fn absorb(&self, custodian: &str, signal: &CustodySignal) -> bool {
        assert_eq!(custodian, "ipn:1.0");
        assert!(signal.succeeded);
        self.absorbed.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[derive(Default)]
struct Counting {
    forwarded: AtomicUsize,
    dequeued: AtomicUsize,
}

impl ExtensionHooks for Counting {
    fn on_forward(&self, _bundle: &mut Bundle) {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dequeue(&self, _bundle: &mut Bundle) {
        self.dequeued.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn installed_hooks_see_the_traffic() {
    let clock = Arc::new(ManualClock::new(START));
    let counting = Arc::new(Counting::default());
    let aggregate = Arc::new(Aggregate::default());

    let mut c1 = config(1);
    c1.plans = vec![plan(2)];
    let a = Arc::new(
        NodeBuilder::from_config(c1)
            .with_clock(clock.clone())
            .with_extension_hooks(counting.clone())
            .build()
            .unwrap(),
    );
    let mut c2 = config(2);
    c2.plans = vec![plan(1)];
    let b = Arc::new(
        NodeBuilder::from_config(c2)
            .with_clock(clock.clone())
            .with_aggregator(aggregate.clone())
            .build()
            .unwrap(),
    );

    send(&a, &custodial("ipn:1.1", "ipn:2.1"), b"aggregated").await.unwrap();
    relay(&a, &b, 2).await.unwrap();
    assert_eq!(counting.forwarded.load(Ordering::SeqCst), 1);
    assert_eq!(counting.dequeued.load(Ordering::SeqCst), 1);

    assert_eq!(aggregate.absorbed.load(Ordering::SeqCst), 1);
    assert_eq!(relay(&b, &a, 1).await.unwrap(), 0);
    assert_eq!(a.stats().unwrap().current.count, 1);
}
