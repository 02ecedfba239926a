use std::sync::Arc;

use ferry_core::admin::AdminRecord;
use ferry_core::wire::SRR_DELIVERED;
use ferry_engine::{DelReason, ManualClock, StateStat};

use crate::*;

#[tokio::test]
async fn bundle_crosses_one_hop() {
    let (a, b, _) = pair();
    send(&a, &request("ipn:1.1", "ipn:2.1"), b"hello from 1").await.unwrap();

    assert_eq!(relay(&a, &b, 2).await.unwrap(), 1);
    assert_eq!(received(&b, "ipn:2.1").await.unwrap(), vec![b"hello from 1".to_vec()]);

    let sa = a.stats().unwrap();
    assert_eq!(sa.current.count, 0);
    assert_eq!(sa.deleted(DelReason::Forwarded).count, 1);
    let sb = b.stats().unwrap();
    assert_eq!(sb.current.count, 0);
    assert_eq!(sb.total(StateStat::Received).count, 1);
    assert_eq!(sb.total(StateStat::Delivered).count, 1);
}

#[tokio::test]
async fn middle_node_relays_in_transit() {
    let clock = Arc::new(ManualClock::new(START));
    let mut c1 = config(1);
    c1.plans = vec![plan(2)];
    c1.routes = vec![route("ipn:3.*", "ipn:2.0")];
    let mut c2 = config(2);
    c2.plans = vec![plan(1), plan(3)];
    let mut c3 = config(3);
    c3.plans = vec![plan(2)];
    let (a, b, c) = (build(c1, &clock), build(c2, &clock), build(c3, &clock));

    send(&a, &request("ipn:1.1", "ipn:3.1"), b"two hops").await.unwrap();
    assert_eq!(relay(&a, &b, 2).await.unwrap(), 1);
    assert_eq!(relay(&b, &c, 3).await.unwrap(), 1);

    assert_eq!(received(&c, "ipn:3.1").await.unwrap(), vec![b"two hops".to_vec()]);
    let sb = b.stats().unwrap();
    assert_eq!(sb.current.count, 0);
    assert_eq!(sb.deleted(DelReason::Forwarded).count, 1);
    assert_eq!(sb.total(StateStat::Delivered).count, 0);
}

#[tokio::test]
async fn delivery_report_returns_to_source() {
    let (a, b, _) = pair();
    let mut req = request("ipn:1.1", "ipn:2.1");
    req.srr = SRR_DELIVERED;
    send(&a, &req, b"let me know").await.unwrap();

    relay(&a, &b, 2).await.unwrap();
    assert_eq!(relay(&b, &a, 1).await.unwrap(), 1);

    a.open_endpoint("ipn:1.1").unwrap();
    let report = a.receive("ipn:1.1", false, false).await.unwrap().unwrap();
    assert!(report.admin);
    let AdminRecord::StatusReport(sr) = AdminRecord::parse(&report.content.read().unwrap()).unwrap()
    else {
        panic!("expected a status report");
    };
    assert_eq!(sr.flags, SRR_DELIVERED);
    assert_eq!(sr.source_eid, "ipn:1.1");
    assert_eq!(sr.delivery_time.seconds, START);
}

#[tokio::test]
async fn unroutable_bundle_is_abandoned() {
    let (a, _, _) = pair();
    send(&a, &request("ipn:1.1", "ipn:9.1"), b"nowhere").await.unwrap();
    drain(&a).unwrap();

    let stats = a.stats().unwrap();
    assert_eq!(stats.current.count, 0);
    assert_eq!(stats.total(StateStat::Abandoned).count, 1);
    assert_eq!(stats.deleted(DelReason::NoRoute).count, 1);
}

#[tokio::test]
async fn queued_bundle_expires() {
    let (a, _, clock) = pair();
    let mut req = request("ipn:1.1", "ipn:2.1");
    req.lifetime = 30;
    send(&a, &req, b"short lived").await.unwrap();
    drain(&a).unwrap();

    clock.advance(29);
    assert_eq!(a.dispatch_events().unwrap(), 0);
    clock.advance(1);
    assert_eq!(a.dispatch_events().unwrap(), 1);

    assert!(take_outbound(&a, "tcp/2").unwrap().is_empty());
    assert!(pump(&a, "ipn:2.0").unwrap().is_empty());
    let stats = a.stats().unwrap();
    assert_eq!(stats.current.count, 0);
    assert_eq!(stats.deleted(DelReason::Expired).count, 1);
}

#[tokio::test]
async fn garbled_transmission_is_counted_and_dropped() {
    let (_, b, _) = pair();
    assert_eq!(acquire(&b, "ipn:1.0", &[0x06, 0xFF, 0xFF]).await.unwrap(), 0);
    let stats = b.stats().unwrap();
    assert_eq!(stats.current.count, 0);
    assert_eq!(stats.deleted(DelReason::Unintelligible).count, 1);
}
