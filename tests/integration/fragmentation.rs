use std::sync::Arc;

use ferry_core::wire::{PrimaryBlock, Reader};
use ferry_engine::{DelReason, ManualClock, Node, PlanStep};

use crate::*;

/// Node 1 whose duct to node 2 carries at most four payload bytes.
fn narrow_pair() -> (Arc<Node>, Arc<Node>) {
    let clock = Arc::new(ManualClock::new(START));
    let mut a = config(1);
    let mut narrow = plan(2);
    narrow.max_payload_len = 4;
    a.plans = vec![narrow];
    let mut b = config(2);
    b.plans = vec![plan(1)];
    (build(a, &clock), build(b, &clock))
}

fn fragment_offset(bytes: &[u8]) -> u64 {
    let primary = PrimaryBlock::decode(&mut Reader::new(bytes)).unwrap();
    primary.fragment.expect("a fragment").offset
}

#[tokio::test]
async fn fragments_reassemble_at_destination() {
    let (a, b) = narrow_pair();
    send(&a, &request("ipn:1.1", "ipn:2.1"), b"abcdefghij").await.unwrap();

    assert_eq!(relay(&a, &b, 2).await.unwrap(), 3);
    assert_eq!(received(&b, "ipn:2.1").await.unwrap(), vec![b"abcdefghij".to_vec()]);

    let sa = a.stats().unwrap();
    assert_eq!(sa.current.count, 0);
    assert_eq!(sa.deleted(DelReason::Forwarded).count, 3);
    assert_eq!(b.stats().unwrap().current.count, 0);
}

#[tokio::test]
async fn fragments_arriving_backwards_still_reassemble() {
    let (a, b) = narrow_pair();
    send(&a, &request("ipn:1.1", "ipn:2.1"), b"0123456789").await.unwrap();
    drain(&a).unwrap();
    pump(&a, "ipn:2.0").unwrap();

    let outbound = take_outbound(&a, "tcp/2").unwrap();
    let offsets: Vec<u64> = outbound.iter().map(|o| fragment_offset(&o.bytes)).collect();
    assert_eq!(offsets, vec![0, 4, 8]);

    for bundle in outbound.iter().rev() {
        assert_eq!(acquire(&b, "ipn:1.0", &bundle.bytes).await.unwrap(), 1);
        a.handle_xmit_success(bundle.bundle).unwrap();
    }
    drain(&b).unwrap();
    assert_eq!(received(&b, "ipn:2.1").await.unwrap(), vec![b"0123456789".to_vec()]);
}

#[tokio::test]
async fn one_transmission_may_carry_every_fragment() {
    let (a, b) = narrow_pair();
    send(&a, &request("ipn:1.1", "ipn:2.1"), b"catenated").await.unwrap();
    drain(&a).unwrap();
    pump(&a, "ipn:2.0").unwrap();

    let outbound = take_outbound(&a, "tcp/2").unwrap();
    let wire: Vec<u8> = outbound.iter().flat_map(|o| o.bytes.iter().copied()).collect();
    assert_eq!(acquire(&b, "ipn:1.0", &wire).await.unwrap(), outbound.len());
    drain(&b).unwrap();
    assert_eq!(received(&b, "ipn:2.1").await.unwrap(), vec![b"catenated".to_vec()]);
}

#[tokio::test]
async fn unfragmentable_bundle_waits_in_limbo() {
    let (a, _) = narrow_pair();
    let mut req = request("ipn:1.1", "ipn:2.1");
    req.do_not_fragment = true;
    send(&a, &req, b"all or nothing").await.unwrap();
    drain(&a).unwrap();

    assert_eq!(pump(&a, "ipn:2.0").unwrap(), vec![PlanStep::Parked]);
    assert!(take_outbound(&a, "tcp/2").unwrap().is_empty());
    let stats = a.stats().unwrap();
    assert_eq!(stats.to_limbo, 1);
    assert_eq!(stats.current.count, 1);
    assert_eq!(stats.fragments_produced, 0);
}
