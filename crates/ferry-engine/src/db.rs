//! The bundle database: every durable table and list, plus the ordered
//! timeline index that mirrors the durable timeline list.

use ferry_core::rbt::{OrderedIndex, Probe};
use ferry_core::CreationTime;

use crate::bundle::{
    Bundle, BundleSet, Endpoint, EventKind, IncompleteBundle, ListOwner, Outduct, Plan, Scheme,
    TimelineEvent,
};
use crate::error::StoreError;
use crate::stats::Stats;
use crate::store::{Cell, Elt, Journal, ListId, Lists, Object, Table};

// ── Timeline index ───────────────────────────────────────────────────────────

/// Index node: the event's ordering key plus where the durable event lives.
#[derive(Debug, Clone, Copy)]
pub struct TimelineKey {
    pub time: u64,
    pub object: Object,
    pub kind: EventKind,
    pub event: Object,
    pub elt: Option<Elt>,
}

impl TimelineKey {
    fn probe(event: &TimelineEvent) -> Self {
        Self { time: event.time, object: event.object, kind: event.kind, event: Object(0), elt: None }
    }
}

fn order_events(a: &TimelineKey, b: &TimelineKey) -> std::cmp::Ordering {
    (a.time, a.object, a.kind).cmp(&(b.time, b.object, b.kind))
}

#[derive(Debug, Clone, Copy)]
enum IndexUndo {
    Inserted(TimelineKey),
    Deleted(TimelineKey),
}

/// The volatile timeline index, journaled so that it rolls back in
/// lock-step with the durable timeline list.
pub struct TimelineIndex {
    index: OrderedIndex<TimelineKey>,
    undo: Vec<IndexUndo>,
}

impl Default for TimelineIndex {
    fn default() -> Self {
        Self { index: OrderedIndex::new(order_events), undo: Vec::new() }
    }
}

impl TimelineIndex {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn search(&self, event: &TimelineEvent) -> Probe {
        self.index.search(&TimelineKey::probe(event))
    }

    pub fn key(&self, probe: Probe) -> Option<TimelineKey> {
        match probe {
            Probe::Found(n) | Probe::Successor(n) => self.index.data(n),
            Probe::End => None,
        }
    }

    pub fn first(&self) -> Option<TimelineKey> {
        self.index.first().and_then(|n| self.index.data(n))
    }

    fn insert(&mut self, key: TimelineKey) -> Result<(), StoreError> {
        self.index.insert(key).ok_or(StoreError::Index("insert"))?;
        self.undo.push(IndexUndo::Inserted(key));
        Ok(())
    }

    fn delete(&mut self, event: &TimelineEvent) -> Option<TimelineKey> {
        let removed = self.index.delete(&TimelineKey::probe(event))?;
        self.undo.push(IndexUndo::Deleted(removed));
        Some(removed)
    }

    pub fn to_vec(&self) -> Vec<TimelineKey> {
        self.index.to_vec()
    }
}

impl Journal for TimelineIndex {
    fn commit(&mut self) {
        self.undo.clear();
    }

    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                IndexUndo::Inserted(key) => {
                    self.index.delete(&key);
                }
                IndexUndo::Deleted(key) => {
                    self.index.insert(key);
                }
            }
        }
    }
}

// ── Database ─────────────────────────────────────────────────────────────────

pub struct BpDb {
    pub bundles: Table<Object, Bundle>,
    pub incompletes: Table<Object, IncompleteBundle>,
    pub events: Table<Object, TimelineEvent>,
    pub bundle_sets: Table<String, BundleSet>,
    pub lists: Lists<ListOwner>,
    pub schemes: Table<String, Scheme>,
    pub endpoints: Table<String, Endpoint>,
    /// Keyed by neighbor EID, wildcards written with a trailing `~` so
    /// they sort after every more specific name.
    pub plans: Table<String, Plan>,
    pub outducts: Table<String, Outduct>,
    pub timeline: ListId,
    pub transit: ListId,
    pub limbo: ListId,
    pub stats: Cell<Stats>,
    pub index: TimelineIndex,
    last_creation: Cell<CreationTime>,
    next_object: Cell<u64>,
}

impl Default for BpDb {
    fn default() -> Self {
        Self::new()
    }
}

impl BpDb {
    pub fn new() -> Self {
        let mut lists = Lists::new();
        let timeline = lists.create(ListOwner::Timeline);
        let transit = lists.create(ListOwner::Transit);
        let limbo = lists.create(ListOwner::Limbo);
        lists.commit();
        Self {
            bundles: Table::new(),
            incompletes: Table::new(),
            events: Table::new(),
            bundle_sets: Table::new(),
            lists,
            schemes: Table::new(),
            endpoints: Table::new(),
            plans: Table::new(),
            outducts: Table::new(),
            timeline,
            transit,
            limbo,
            stats: Cell::new(Stats::default()),
            index: TimelineIndex::default(),
            last_creation: Cell::new(CreationTime::default()),
            next_object: Cell::new(1),
        }
    }

    pub fn new_object(&mut self) -> Object {
        let next = self.next_object.stage();
        let obj = Object(*next);
        *next += 1;
        obj
    }

    /// Next creation timestamp: the count restarts whenever the seconds
    /// advance.
    pub fn next_creation_time(&mut self, seconds: u64) -> CreationTime {
        let last = self.last_creation.stage();
        if seconds > last.seconds {
            *last = CreationTime { seconds, count: 0 };
        } else {
            last.count += 1;
        }
        *last
    }

    pub fn bundle(&self, obj: Object) -> Result<&Bundle, StoreError> {
        self.bundles.get(&obj).ok_or(StoreError::NoSuchObject(obj.0))
    }

    pub fn bundle_mut(&mut self, obj: Object) -> Result<&mut Bundle, StoreError> {
        self.bundles.stage(&obj).ok_or(StoreError::NoSuchObject(obj.0))
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        self.stats.stage()
    }

    // ── Timeline ──

    /// Insert an event into the durable timeline and its index. If an
    /// event with the same key is already there, its element is returned
    /// and nothing changes.
    pub fn insert_event(&mut self, event: TimelineEvent) -> Result<Elt, StoreError> {
        let probe = self.index.search(&event);
        let before = match probe {
            Probe::Found(_) => {
                return self
                    .index
                    .key(probe)
                    .and_then(|k| k.elt)
                    .ok_or(StoreError::Index("stale node"));
            }
            Probe::Successor(_) => self.index.key(probe).and_then(|k| k.elt),
            Probe::End => None,
        };

        let obj = self.new_object();
        self.events.insert(obj, event);
        let elt = match before {
            Some(next) => self.lists.insert_before(next, obj)?,
            None => self.lists.insert_last(self.timeline, obj)?,
        };
        self.index.insert(TimelineKey {
            time: event.time,
            object: event.object,
            kind: event.kind,
            event: obj,
            elt: Some(elt),
        })?;
        Ok(elt)
    }

    pub fn destroy_event(&mut self, elt: Elt) -> Result<(), StoreError> {
        let obj = self.lists.data(elt)?;
        let event = *self.events.get(&obj).ok_or(StoreError::NoSuchObject(obj.0))?;
        self.index.delete(&event);
        self.events.remove(&obj);
        self.lists.delete(elt)?;
        Ok(())
    }

    /// The earliest event, if it is due at `now`.
    pub fn next_due_event(&self, now: u64) -> Option<(Elt, TimelineEvent)> {
        let key = self.index.first()?;
        if key.time > now {
            return None;
        }
        let event = *self.events.get(&key.event)?;
        Some((key.elt?, event))
    }
}

impl Journal for BpDb {
    fn commit(&mut self) {
        self.bundles.commit();
        self.incompletes.commit();
        self.events.commit();
        self.bundle_sets.commit();
        self.lists.commit();
        self.schemes.commit();
        self.endpoints.commit();
        self.plans.commit();
        self.outducts.commit();
        self.stats.commit();
        self.index.commit();
        self.last_creation.commit();
        self.next_object.commit();
    }

    fn rollback(&mut self) {
        self.bundles.rollback();
        self.incompletes.rollback();
        self.events.rollback();
        self.bundle_sets.rollback();
        self.lists.rollback();
        self.schemes.rollback();
        self.endpoints.rollback();
        self.plans.rollback();
        self.outducts.rollback();
        self.stats.rollback();
        self.index.rollback();
        self.last_creation.rollback();
        self.next_object.rollback();
    }
}
