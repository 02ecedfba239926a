//! The bundle data model and the other stored records.

use std::fmt;

use ferry_core::admin::StatusReport;
use ferry_core::config::RecvRule;
use ferry_core::eid::{EidRef, NULL_EID};
use ferry_core::wire::{ExtendedCos, ExtensionBlock, ProcFlags};
use ferry_core::{CreationTime, Dictionary, DtnTime, Priority};

use crate::store::{Elt, ListId, Object};

/// Longest hash key that gets indexed.
pub const BUNDLES_HASH_KEY_LEN: usize = 64;

/// Size assumed for a primary block when estimating wire size.
pub const NOMINAL_PRIMARY_BLKSIZE: u64 = 29;

/// Floor on the convergence-layer overhead estimate.
pub const TYPICAL_STACK_OVERHEAD: u64 = 36;

/// Estimated convergence-layer transmission cost of a bundle of `size` bytes:
/// the size plus 6.25% stack overhead, at least `TYPICAL_STACK_OVERHEAD`.
pub fn compute_eccc(size: u64) -> u64 {
    size + (size >> 4).max(TYPICAL_STACK_OVERHEAD)
}

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleId {
    pub source: String,
    pub creation: CreationTime,
    pub fragment_offset: u64,
    /// Fragment length, or 0 for a whole bundle.
    pub fragment_length: u64,
}

impl BundleId {
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.source,
            self.creation.seconds,
            self.creation.count,
            self.fragment_offset,
            self.fragment_length
        )
    }

    pub fn is_anonymous(&self) -> bool {
        self.source == NULL_EID
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source, self.creation)?;
        if self.fragment_length > 0 {
            write!(f, "+{}/{}", self.fragment_offset, self.fragment_length)?;
        }
        Ok(())
    }
}

/// A hash value: every catalogued bundle sharing one identity key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleSet {
    pub members: Vec<Object>,
}

/// Result of looking a bundle up by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    Absent,
    Ambiguous(u32),
    Unique(Object),
}

// ── Membership ───────────────────────────────────────────────────────────────

/// Anything that keeps a bundle alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Holder {
    Forward = 1 << 0,
    Plan = 1 << 1,
    Duct = 1 << 2,
    Delivery = 1 << 3,
    Fragment = 1 << 4,
    Transit = 1 << 5,
    Limbo = 1 << 6,
    Custody = 1 << 7,
    Detained = 1 << 8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolderSet(u16);

impl HolderSet {
    pub fn insert(&mut self, h: Holder) {
        self.0 |= h as u16;
    }

    pub fn contains(self, h: Holder) -> bool {
        self.0 & h as u16 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HolderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Holder, &str); 9] = [
            (Holder::Forward, "forward"),
            (Holder::Plan, "plan"),
            (Holder::Duct, "duct"),
            (Holder::Delivery, "delivery"),
            (Holder::Fragment, "fragment"),
            (Holder::Transit, "transit"),
            (Holder::Limbo, "limbo"),
            (Holder::Custody, "custody"),
            (Holder::Detained, "detained"),
        ];
        let held: Vec<&str> = NAMES
            .iter()
            .filter(|(h, _)| self.contains(*h))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "[{}]", held.join(","))
    }
}

/// Back-references to every list element that refers to a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Memberships {
    pub forward: Option<Elt>,
    pub plan: Option<Elt>,
    pub limbo: Option<Elt>,
    pub duct: Option<Elt>,
    pub delivery: Option<Elt>,
    pub fragment: Option<Elt>,
    pub transit: Option<Elt>,
    pub ttl: Option<Elt>,
    pub ct_due: Option<Elt>,
    pub overdue: Option<Elt>,
}

// ── Bundle ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Payload {
    pub length: u64,
    pub content: crate::zco::Zco,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub flags: ProcFlags,
    pub destination: EidRef,
    pub source: EidRef,
    pub report_to: EidRef,
    pub custodian: EidRef,
    /// Empty when every EID is carried in CBHE form.
    pub dictionary: Dictionary,
    pub lifetime: u64,
    /// DTN seconds at which the bundle expires.
    pub expiration: u64,
    pub total_adu_length: u64,
    pub payload: Payload,
    pub ecos: ExtendedCos,
    /// Blocks between the primary and payload blocks.
    pub extensions: Vec<ExtensionBlock>,
    /// Blocks after the payload block.
    pub trailers: Vec<ExtensionBlock>,
    /// EIDs this bundle has been forwarded toward during the current
    /// routing attempt, most recent first.
    pub stations: Vec<String>,
    /// Neighbor whose plan the bundle is queued on.
    pub prox_node_eid: Option<String>,
    pub enqueue_time: u64,
    /// Transmission cost charged to the plan backlog at enqueue.
    pub eccc: u64,
    pub custody_taken: bool,
    pub accepted: bool,
    pub delivered: bool,
    pub detained: bool,
    pub suspended: bool,
    pub corrupt: bool,
    pub catalogued: bool,
    pub status_rpt: StatusReport,
    pub arrival: DtnTime,
    pub holders: Memberships,
}

impl Bundle {
    pub fn priority(&self) -> Priority {
        self.flags.priority()
    }

    pub fn ordinal(&self) -> u8 {
        self.ecos.ordinal
    }

    pub fn is_critical(&self) -> bool {
        self.ecos.is_critical()
    }

    pub fn extensions_length(&self) -> u64 {
        self.extensions
            .iter()
            .chain(self.trailers.iter())
            .map(|b| b.encoded_len() as u64)
            .sum()
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_anonymous()
    }

    pub fn guess_size(&self) -> u64 {
        NOMINAL_PRIMARY_BLKSIZE + self.extensions_length() + self.payload.length
    }

    pub fn eid(&self, eid: &EidRef) -> Result<String, ferry_core::eid::EidError> {
        self.dictionary.resolve(eid)
    }

    pub fn destination_eid(&self) -> Result<String, ferry_core::eid::EidError> {
        self.eid(&self.destination)
    }

    pub fn source_eid(&self) -> Result<String, ferry_core::eid::EidError> {
        self.eid(&self.source)
    }

    pub fn custodian_eid(&self) -> Result<String, ferry_core::eid::EidError> {
        self.eid(&self.custodian)
    }

    pub fn report_to_eid(&self) -> Result<String, ferry_core::eid::EidError> {
        self.eid(&self.report_to)
    }

    /// Everything currently keeping this bundle alive.
    pub fn holder_set(&self) -> HolderSet {
        let mut set = HolderSet::default();
        let m = &self.holders;
        if m.forward.is_some() {
            set.insert(Holder::Forward);
        }
        if m.plan.is_some() {
            set.insert(Holder::Plan);
        }
        if m.duct.is_some() {
            set.insert(Holder::Duct);
        }
        if m.delivery.is_some() {
            set.insert(Holder::Delivery);
        }
        if m.fragment.is_some() {
            set.insert(Holder::Fragment);
        }
        if m.transit.is_some() {
            set.insert(Holder::Transit);
        }
        if m.limbo.is_some() {
            set.insert(Holder::Limbo);
        }
        if self.custody_taken {
            set.insert(Holder::Custody);
        }
        if self.detained {
            set.insert(Holder::Detained);
        }
        set
    }
}

// ── Reassembly ───────────────────────────────────────────────────────────────

/// Fragments of one ADU collected at an endpoint until they cover it.
#[derive(Debug, Clone)]
pub struct IncompleteBundle {
    pub source: String,
    pub creation: CreationTime,
    pub endpoint: String,
    /// Fragments in offset order.
    pub fragments: ListId,
    pub total_adu_length: u64,
    /// Element in the endpoint's incompletes list.
    pub elt: Option<Elt>,
}

impl IncompleteBundle {
    pub fn matches(&self, id: &BundleId) -> bool {
        self.source == id.source && self.creation == id.creation
    }
}

// ── Schemes, endpoints, plans, outducts ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Scheme {
    pub name: String,
    pub forward_queue: ListId,
    pub admin_eid: String,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub eid: String,
    pub scheme: String,
    pub delivery_queue: ListId,
    pub incompletes: ListId,
    pub recv_rule: RecvRule,
    pub script: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrdinalState {
    pub backlog: u64,
    /// Last urgent queue element with this ordinal.
    pub last: Option<Elt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PlanStats {
    pub enqueued_count: u64,
    pub enqueued_bytes: u64,
    pub dequeued_count: u64,
    pub dequeued_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub neighbor: String,
    /// Bulk, standard and urgent queues, indexed by `Priority::index`.
    pub queues: [ListId; 3],
    pub ordinals: Vec<OrdinalState>,
    pub backlog: [u64; 3],
    pub blocked: bool,
    pub nominal_rate: u64,
    pub max_payload_len: u64,
    pub outducts: Vec<String>,
    pub stats: PlanStats,
}

impl Plan {
    pub fn total_backlog(&self) -> u64 {
        self.backlog.iter().sum()
    }
}

#[derive(Debug, Clone)]
pub struct Outduct {
    pub name: String,
    pub xmit_buffer: ListId,
    pub max_payload_len: u64,
}

// ── Timeline ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    ExpiredTtl = 1,
    CtDue = 2,
    XmitOverdue = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEvent {
    pub time: u64,
    pub object: Object,
    pub kind: EventKind,
}

/// Who owns a durable list, stored as the list's user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOwner {
    Timeline,
    Transit,
    Limbo,
    Forward(String),
    Delivery(String),
    Incompletes(String),
    Fragments(Object),
    PlanQueue { plan: String, priority: Priority },
    Duct(String),
}
