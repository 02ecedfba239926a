//! Test rig: a provisioned single-node database driven by a manual clock.

use std::sync::Arc;

use bytes::Bytes;
use ferry_core::config::{EndpointConfig, FerryConfig, PlanConfig, RecvRule, SchemeConfig};

use crate::clock::{Clock, ManualClock};
use crate::db::BpDb;
use crate::engine::{Engine, Env};
use crate::hooks::Hooks;
use crate::routing::StaticRouter;
use crate::send::SendRequest;
use crate::store::{Journal, Object};
use crate::xmit::Outbound;
use crate::zco::{Residence, Zco};

const START: u64 = 1_000;

/// Node 1 with application endpoint `ipn:1.1`, a `dtn` scheme and one
/// plan to `ipn:2.0` over duct `tcp/2`.
pub(crate) fn config() -> FerryConfig {
    let mut cfg = FerryConfig::default();
    cfg.node.node_number = 1;
    cfg.node.custodian_service = 0;
    cfg.node.work_dir = std::env::temp_dir().join(format!("ferry-engine-test-{}", std::process::id()));
    cfg.schemes = vec![
        SchemeConfig {
            name: "ipn".into(),
            endpoints: vec![EndpointConfig {
                nss: "1.1".into(),
                recv_rule: RecvRule::Enqueue,
                script: None,
            }],
        },
        SchemeConfig { name: "dtn".into(), endpoints: Vec::new() },
    ];
    cfg.plans = vec![PlanConfig {
        neighbor: "ipn:2.0".into(),
        nominal_rate: 0,
        max_payload_len: 0,
        outducts: vec!["tcp/2".into()],
    }];
    cfg.routes = Vec::new();
    cfg
}

pub(crate) fn env(cfg: FerryConfig) -> Env {
    let router = Box::new(StaticRouter::new(&cfg.routes));
    Env::new(&cfg, Arc::new(ManualClock::new(START)), router, Hooks::default())
}

pub(crate) struct Rig {
    pub env: Env,
    pub clock: Arc<ManualClock>,
    pub db: BpDb,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(cfg: FerryConfig) -> Self {
        let hooks = Hooks::from_config(&cfg.forwarding.hooks);
        Self::with_hooks(cfg, hooks)
    }

    pub fn with_hooks(cfg: FerryConfig, hooks: Hooks) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let router = Box::new(StaticRouter::new(&cfg.routes));
        let env = Env::new(&cfg, clock.clone(), router, hooks);
        let mut db = BpDb::new();
        Engine::new(&mut db, &env).provision(&cfg).expect("provision test node");
        db.commit();
        Self { env, clock, db }
    }

    pub fn engine(&mut self) -> Engine<'_> {
        Engine::new(&mut self.db, &self.env)
    }

    pub fn commit(&mut self) {
        self.db.commit();
    }

    pub fn now(&self) -> u64 {
        self.clock.now().seconds
    }

    pub fn payload(&self, bytes: &[u8]) -> Zco {
        let lease = self.env.space.try_reserve(Residence::Heap, bytes.len() as u64);
        Zco::from_heap(Bytes::copy_from_slice(bytes), lease)
    }

    pub fn request(&self, destination: &str) -> SendRequest {
        SendRequest::new("ipn:1.1", destination, 3600)
    }

    pub fn send(&mut self, destination: &str, bytes: &[u8]) -> Object {
        let req = self.request(destination);
        self.send_request(&req, bytes)
    }

    pub fn send_custodial(&mut self, destination: &str, bytes: &[u8]) -> Object {
        let mut req = self.request(destination);
        req.custody = true;
        self.send_request(&req, bytes)
    }

    pub fn send_request(&mut self, req: &SendRequest, bytes: &[u8]) -> Object {
        let content = self.payload(bytes);
        self.engine().send(req, content).unwrap().expect("bundle was stored")
    }

    /// Run every forwarder and the transit queue until all are idle.
    pub fn forward_all(&mut self) {
        let schemes: Vec<String> = self.db.schemes.keys().cloned().collect();
        loop {
            let mut busy = false;
            for scheme in &schemes {
                while self.engine().forwarder_step(scheme).unwrap() {
                    busy = true;
                }
            }
            while self.engine().transit_step().unwrap() {
                busy = true;
            }
            if !busy {
                break;
            }
        }
    }

    /// Fire every timeline event due by now. Returns how many fired.
    pub fn dispatch_events(&mut self) -> usize {
        let now = self.now();
        let mut fired = 0;
        while let Some((elt, event)) = self.db.next_due_event(now) {
            self.engine().process_event(elt, event).unwrap();
            fired += 1;
        }
        fired
    }

    /// Administrative bundles in the database addressed to `eid`.
    pub fn admin_bundles_to(&self, eid: &str) -> Vec<Object> {
        self.db
            .bundles
            .iter()
            .filter(|(_, b)| b.flags.is_admin() && b.destination_eid().ok().as_deref() == Some(eid))
            .map(|(obj, _)| *obj)
            .collect()
    }

    pub fn take_delivery(&mut self, endpoint: &str) -> Option<Object> {
        self.engine().take_delivery(endpoint).unwrap()
    }

    pub fn dequeue(&mut self, duct: &str) -> Option<Outbound> {
        self.engine().dequeue(duct).unwrap()
    }
}
