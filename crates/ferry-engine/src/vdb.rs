//! Volatile database: per-scheme, per-plan, per-duct and per-endpoint
//! wake-up semaphores, plan throttles and routing snubs. Rebuilt from the
//! durable tables at startup; never journaled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};

use crate::semaphore::BpSemaphore;

/// Seconds of nominal traffic by which the most serviced non-urgent flow
/// may lead the least serviced one before both are reset.
pub const MAX_STARVATION: u64 = 10;
pub const NOMINAL_BYTES_PER_SEC: u64 = 256 * 1024;

// ── Throttle ─────────────────────────────────────────────────────────────────

/// Rate control for a plan: capacity is spent per dequeued bundle and
/// refilled once per second up to the nominal rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throttle {
    /// Bytes per second. 0 = unthrottled.
    pub nominal_rate: u64,
    /// May go negative when a large bundle overdraws it.
    pub capacity: i64,
}

impl Throttle {
    pub fn new(nominal_rate: u64) -> Self {
        Self { nominal_rate, capacity: clamp(nominal_rate) }
    }

    /// True if a bundle may be dequeued now.
    pub fn is_open(&self) -> bool {
        self.nominal_rate == 0 || self.capacity > 0
    }

    pub fn consume(&mut self, bytes: u64) {
        if self.nominal_rate > 0 {
            self.capacity = self.capacity.saturating_sub(clamp(bytes));
        }
    }

    /// One second's worth of refill, never above the nominal rate.
    pub fn replenish(&mut self) {
        if self.nominal_rate > 0 {
            let rate = clamp(self.nominal_rate);
            self.capacity = self.capacity.saturating_add(rate).min(rate);
        }
    }

    /// Transmission already committed during the current second.
    pub fn committed(&self) -> u64 {
        if self.nominal_rate == 0 {
            return 0;
        }
        (clamp(self.nominal_rate) - self.capacity).max(0) as u64
    }
}

fn clamp(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// ── Per-object volatile state ────────────────────────────────────────────────

#[derive(Debug)]
pub struct VPlan {
    pub semaphore: Arc<BpSemaphore>,
    pub throttle: Mutex<Throttle>,
    /// Bytes sent on the bulk and standard flows, for bandwidth-reserved
    /// selection.
    pub flow_bytes: Mutex<[u64; 2]>,
}

impl VPlan {
    pub fn new(nominal_rate: u64) -> Self {
        Self {
            semaphore: Arc::new(BpSemaphore::new()),
            throttle: Mutex::new(Throttle::new(nominal_rate)),
            flow_bytes: Mutex::new([0; 2]),
        }
    }

    pub fn throttle(&self) -> Throttle {
        self.throttle.lock().map(|t| *t).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct VEndpoint {
    pub semaphore: Arc<BpSemaphore>,
    /// Held open by an application.
    pub open: AtomicBool,
}

impl VEndpoint {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// A neighbor that refused custody of bundles for a destination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Snub {
    pub destination: u64,
    pub neighbor: u64,
}

#[derive(Debug, Default)]
pub struct Vdb {
    pub schemes: DashMap<String, Arc<BpSemaphore>>,
    pub endpoints: DashMap<String, Arc<VEndpoint>>,
    pub plans: DashMap<String, Arc<VPlan>>,
    pub ducts: DashMap<String, Arc<BpSemaphore>>,
    pub transit: Arc<BpSemaphore>,
    pub snubs: DashSet<Snub>,
}

impl Vdb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn give_scheme(&self, scheme: &str) {
        if let Some(sem) = self.schemes.get(scheme) {
            sem.give();
        }
    }

    pub fn give_plan(&self, plan: &str) {
        if let Some(vplan) = self.plans.get(plan) {
            vplan.semaphore.give();
        }
    }

    pub fn give_duct(&self, duct: &str) {
        if let Some(sem) = self.ducts.get(duct) {
            sem.give();
        }
    }

    pub fn plan(&self, plan: &str) -> Option<Arc<VPlan>> {
        self.plans.get(plan).map(|p| p.value().clone())
    }

    pub fn endpoint(&self, eid: &str) -> Option<Arc<VEndpoint>> {
        self.endpoints.get(eid).map(|e| e.value().clone())
    }

    pub fn is_snubbed(&self, destination: u64, neighbor: u64) -> bool {
        self.snubs.contains(&Snub { destination, neighbor })
    }

    /// Refill every plan throttle by one second's worth, waking each plan
    /// that can send again.
    pub fn replenish_throttles(&self) {
        for vplan in self.plans.iter() {
            let open = match vplan.throttle.lock() {
                Ok(mut throttle) => {
                    throttle.replenish();
                    throttle.nominal_rate > 0 && throttle.is_open()
                }
                Err(_) => false,
            };
            if open {
                vplan.semaphore.give();
            }
        }
    }

    /// End every semaphore so that waiting tasks shut down.
    pub fn end_all(&self) {
        self.transit.end();
        for s in self.schemes.iter() {
            s.end();
        }
        for p in self.plans.iter() {
            p.semaphore.end();
        }
        for d in self.ducts.iter() {
            d.end();
        }
        for e in self.endpoints.iter() {
            e.semaphore.end();
        }
    }
}
