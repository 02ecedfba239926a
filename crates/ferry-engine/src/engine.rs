//! The engine: bundle-processing operations run against the database inside
//! one transaction.
//!
//! An `Engine` borrows the transaction's database and the node's
//! environment. Operations live in their own modules as `impl Engine`
//! blocks. None of them commits; the caller ends or cancels.

use std::path::PathBuf;
use std::sync::Arc;

use ferry_core::config::{FerryConfig, PriorClaims, RecvRule};
use ferry_core::{DtnTime, MetaEid, Priority};

use crate::bundle::{Endpoint, ListOwner, OrdinalState, Outduct, Plan, PlanStats, Scheme};
use crate::clock::Clock;
use crate::db::BpDb;
use crate::error::{EngineError, Result};
use crate::hooks::Hooks;
use crate::routing::Router;
use crate::semaphore::BpSemaphore;
use crate::vdb::{VEndpoint, VPlan, Vdb};
use crate::zco::ZcoSpace;

/// Number of urgent ordinals.
pub const ORDINALS: usize = 256;

/// Everything an operation needs besides the database.
pub struct Env {
    pub own_node: u64,
    /// The EID that takes custody and receives administrative records.
    pub custodian_eid: String,
    pub prior_claims: PriorClaims,
    /// Seconds. 0 = never.
    pub custody_timeout: u64,
    /// Seconds. 0 = never.
    pub xmit_overdue: u64,
    pub max_acq_in_heap: u64,
    pub work_dir: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub vdb: Vdb,
    pub hooks: Hooks,
    pub router: Box<dyn Router>,
    pub space: ZcoSpace,
}

impl Env {
    pub fn new(
        config: &FerryConfig,
        clock: Arc<dyn Clock>,
        router: Box<dyn Router>,
        hooks: Hooks,
    ) -> Self {
        Self {
            own_node: config.node.node_number,
            custodian_eid: config.custodian_eid(),
            prior_claims: config.forwarding.prior_claims,
            custody_timeout: config.forwarding.custody_timeout_secs,
            xmit_overdue: config.forwarding.xmit_overdue_secs,
            max_acq_in_heap: config.node.max_acq_in_heap,
            work_dir: config.node.work_dir.clone(),
            clock,
            vdb: Vdb::new(),
            hooks,
            router,
            space: ZcoSpace::new(config.node.heap_limit, config.node.file_limit),
        }
    }
}

pub struct Engine<'a> {
    pub(crate) db: &'a mut BpDb,
    pub(crate) env: &'a Env,
}

impl<'a> Engine<'a> {
    pub fn new(db: &'a mut BpDb, env: &'a Env) -> Self {
        Self { db, env }
    }

    pub(crate) fn now(&self) -> DtnTime {
        self.env.clock.now()
    }

    // ── Provisioning ──

    /// Create everything the configuration names. The CBHE scheme and the
    /// custodial endpoint always exist.
    pub fn provision(&mut self, config: &FerryConfig) -> Result<()> {
        for scheme in &config.schemes {
            self.add_scheme(&scheme.name)?;
            for endpoint in &scheme.endpoints {
                let eid = scheme.endpoint_eid(endpoint);
                self.add_endpoint(&eid, endpoint.recv_rule, endpoint.script.clone())?;
            }
        }
        let cbhe = ferry_core::eid::CBHE_SCHEME.to_string();
        if !self.db.schemes.contains(&cbhe) {
            self.add_scheme(&cbhe)?;
        }
        if !self.db.endpoints.contains(&self.env.custodian_eid) {
            let eid = self.env.custodian_eid.clone();
            self.add_endpoint(&eid, RecvRule::Enqueue, None)?;
        }
        for plan in &config.plans {
            self.add_plan(&plan.neighbor, plan.nominal_rate, plan.max_payload_len, &plan.outducts)?;
        }
        tracing::info!(
            node = self.env.own_node,
            schemes = self.db.schemes.len(),
            endpoints = self.db.endpoints.len(),
            plans = self.db.plans.len(),
            "node provisioned"
        );
        Ok(())
    }

    pub fn add_scheme(&mut self, name: &str) -> Result<()> {
        if self.db.schemes.contains(&name.to_string()) {
            return Err(EngineError::Duplicate(format!("scheme {name}")));
        }
        let forward_queue = self.db.lists.create(ListOwner::Forward(name.to_string()));
        let admin_eid = if name == ferry_core::eid::CBHE_SCHEME {
            format!("{name}:{}.0", self.env.own_node)
        } else {
            self.env.custodian_eid.clone()
        };
        self.db.schemes.insert(
            name.to_string(),
            Scheme { name: name.to_string(), forward_queue, admin_eid },
        );
        self.env.vdb.schemes.insert(name.to_string(), Arc::new(BpSemaphore::new()));
        tracing::debug!(scheme = name, "scheme added");
        Ok(())
    }

    pub fn add_endpoint(&mut self, eid: &str, recv_rule: RecvRule, script: Option<String>) -> Result<()> {
        let meta = MetaEid::parse(eid)?;
        if !self.db.schemes.contains(&meta.scheme) {
            return Err(EngineError::UnknownScheme(meta.scheme));
        }
        if self.db.endpoints.contains(&eid.to_string()) {
            return Err(EngineError::Duplicate(format!("endpoint {eid}")));
        }
        let delivery_queue = self.db.lists.create(ListOwner::Delivery(eid.to_string()));
        let incompletes = self.db.lists.create(ListOwner::Incompletes(eid.to_string()));
        self.db.endpoints.insert(
            eid.to_string(),
            Endpoint {
                eid: eid.to_string(),
                scheme: meta.scheme,
                delivery_queue,
                incompletes,
                recv_rule,
                script,
            },
        );
        self.env.vdb.endpoints.insert(eid.to_string(), Arc::new(VEndpoint::default()));
        tracing::debug!(endpoint = eid, "endpoint added");
        Ok(())
    }

    pub fn add_outduct(&mut self, name: &str, max_payload_len: u64) -> Result<()> {
        if self.db.outducts.contains(&name.to_string()) {
            return Ok(());
        }
        let xmit_buffer = self.db.lists.create(ListOwner::Duct(name.to_string()));
        self.db.outducts.insert(
            name.to_string(),
            Outduct { name: name.to_string(), xmit_buffer, max_payload_len },
        );
        self.env.vdb.ducts.insert(name.to_string(), Arc::new(BpSemaphore::new()));
        Ok(())
    }

    /// Add an egress plan. A neighbor ending in `*` or `~` is a wildcard
    /// plan, stored with a trailing `~` so it sorts after specific names.
    pub fn add_plan(
        &mut self,
        neighbor: &str,
        nominal_rate: u64,
        max_payload_len: u64,
        outducts: &[String],
    ) -> Result<String> {
        let key = match neighbor.strip_suffix('*').or_else(|| neighbor.strip_suffix('~')) {
            Some(prefix) => format!("{prefix}~"),
            None => neighbor.to_string(),
        };
        if self.db.plans.contains(&key) {
            return Err(EngineError::Duplicate(format!("plan {key}")));
        }
        for duct in outducts {
            self.add_outduct(duct, max_payload_len)?;
        }
        let queues = Priority::ALL.map(|priority| {
            self.db.lists.create(ListOwner::PlanQueue { plan: key.clone(), priority })
        });
        self.db.plans.insert(
            key.clone(),
            Plan {
                neighbor: key.clone(),
                queues,
                ordinals: vec![OrdinalState::default(); ORDINALS],
                backlog: [0; 3],
                blocked: false,
                nominal_rate,
                max_payload_len,
                outducts: outducts.to_vec(),
                stats: PlanStats::default(),
            },
        );
        self.env.vdb.plans.insert(key.clone(), Arc::new(VPlan::new(nominal_rate)));
        tracing::debug!(plan = %key, nominal_rate, "plan added");
        Ok(key)
    }
}
