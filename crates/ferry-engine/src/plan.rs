//! Egress plans: class-of-service queues, backlog accounting, limbo and the
//! plan manager's dequeue step.

use ferry_core::config::PriorClaims;
use ferry_core::wire::BDL_DOES_NOT_FRAGMENT;
use ferry_core::Priority;

use crate::bundle::{compute_eccc, ListOwner};
use crate::engine::{Engine, ORDINALS};
use crate::error::{EngineError, Result};
use crate::stats::StateStat;
use crate::store::{Elt, Object};
use crate::vdb::{MAX_STARVATION, NOMINAL_BYTES_PER_SEC};

/// Outcome of one plan manager step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    /// Every queue is empty.
    Idle,
    /// The plan has spent this second's transmission budget.
    Throttled,
    /// The selected bundle could not be handed to a duct and went to limbo.
    Parked,
    /// The bundle was moved to a duct's transmit buffer.
    Moved(Object),
}

impl Engine<'_> {
    /// The plan for a neighbor: the exact one, else the wildcard plan with
    /// the longest matching prefix.
    pub fn lookup_plan(&self, neighbor: &str) -> Option<String> {
        if self.db.plans.contains(&neighbor.to_string()) {
            return Some(neighbor.to_string());
        }
        self.db
            .plans
            .keys()
            .filter_map(|key| key.strip_suffix('~').map(|prefix| (key, prefix)))
            .filter(|(_, prefix)| neighbor.starts_with(prefix))
            .max_by_key(|(_, prefix)| prefix.len())
            .map(|(key, _)| key.clone())
    }

    fn plan_checked(&self, key: &str) -> Result<&crate::bundle::Plan> {
        self.db
            .plans
            .get(&key.to_string())
            .ok_or_else(|| EngineError::UnknownPlan(key.to_string()))
    }

    fn stage_plan(&mut self, key: &str) -> Result<&mut crate::bundle::Plan> {
        self.db
            .plans
            .stage(&key.to_string())
            .ok_or_else(|| EngineError::UnknownPlan(key.to_string()))
    }

    /// Queue a bundle on a plan. Bulk and standard queues are ordered by
    /// enqueue time; urgent is ordered by descending ordinal, first come
    /// first served within an ordinal.
    pub fn bp_enqueue(&mut self, key: &str, obj: Object) -> Result<()> {
        let now = self.now().seconds;
        let (priority, ordinal, eccc, len, enqueue_time) = {
            let bundle = self.db.bundle_mut(obj)?;
            if bundle.enqueue_time == 0 {
                bundle.enqueue_time = now;
            }
            bundle.eccc = compute_eccc(bundle.guess_size());
            bundle.prox_node_eid = Some(key.to_string());
            (
                bundle.priority(),
                bundle.ordinal() as usize,
                bundle.eccc,
                bundle.payload.length,
                bundle.enqueue_time,
            )
        };
        self.db.stats_mut().tally(StateStat::Forward, priority, len);

        let plan = self.plan_checked(key)?;
        let queue = plan.queues[priority.index()];
        let elt = if priority == Priority::Urgent {
            let after = plan.ordinals[ordinal].last.or_else(|| {
                plan.ordinals[ordinal + 1..].iter().find_map(|o| o.last)
            });
            match after {
                Some(at) => self.db.lists.insert_after(at, obj)?,
                None => self.db.lists.insert_first(queue, obj)?,
            }
        } else {
            self.insert_by_seniority(queue, obj, enqueue_time)?
        };
        self.db.bundle_mut(obj)?.holders.plan = Some(elt);

        let plan = self.stage_plan(key)?;
        plan.backlog[priority.index()] += eccc;
        if priority == Priority::Urgent {
            let slot = &mut plan.ordinals[ordinal];
            slot.backlog += eccc;
            slot.last = Some(elt);
        }
        plan.stats.enqueued_count += 1;
        plan.stats.enqueued_bytes += eccc;
        tracing::debug!(bundle = %obj, plan = key, priority = %priority, eccc, "bundle enqueued");
        self.env.vdb.give_plan(key);
        Ok(())
    }

    /// Append, unless the bundle is senior to the tail: then it goes before
    /// the first strictly later bundle.
    fn insert_by_seniority(
        &mut self,
        queue: crate::store::ListId,
        obj: Object,
        enqueue_time: u64,
    ) -> Result<Elt> {
        let time_of = |engine: &Self, elt: Elt| -> Result<u64> {
            Ok(engine.db.bundle(engine.db.lists.data(elt)?)?.enqueue_time)
        };
        if let Some(tail) = self.db.lists.last(queue)? {
            if enqueue_time < time_of(self, tail)? {
                let mut cursor = self.db.lists.first(queue)?;
                while let Some(elt) = cursor {
                    if time_of(self, elt)? > enqueue_time {
                        return Ok(self.db.lists.insert_before(elt, obj)?);
                    }
                    cursor = self.db.lists.next(elt)?;
                }
            }
        }
        Ok(self.db.lists.insert_last(queue, obj)?)
    }

    /// Bytes queued ahead of a new bundle of this class, and the plan's
    /// whole backlog. Both include what the throttle has already committed
    /// this second.
    pub fn prior_claims(&self, key: &str, priority: Priority, ordinal: u8) -> Result<(u64, u64)> {
        let plan = self.plan_checked(key)?;
        let committed = self.env.vdb.plan(key).map_or(0, |v| v.throttle().committed());
        let [bulk, std, urgent] = plan.backlog;
        let reserved = self.env.prior_claims == PriorClaims::BandwidthReserved;

        let claims = match priority {
            Priority::Bulk => {
                let standard = if reserved { std.min(2 * bulk) } else { std };
                urgent + standard + bulk
            }
            Priority::Standard => {
                let share = if reserved { bulk.min(std / 2) } else { 0 };
                urgent + std + share
            }
            Priority::Urgent => plan.ordinals[ordinal as usize..].iter().map(|o| o.backlog).sum(),
        };
        Ok((claims + committed, plan.total_backlog() + committed))
    }

    /// Take a bundle off its plan queue, keeping backlogs and the ordinal
    /// cache consistent.
    pub(crate) fn remove_from_queue(&mut self, obj: Object) -> Result<()> {
        let Some(elt) = self.db.bundle(obj)?.holders.plan else {
            return Ok(());
        };
        let list = self.db.lists.list_of(elt)?;
        let ListOwner::PlanQueue { plan: key, priority } = self.db.lists.user_data(list)?.clone()
        else {
            return Err(crate::error::StoreError::NoSuchList(list.0).into());
        };
        let (eccc, ordinal) = {
            let bundle = self.db.bundle(obj)?;
            (bundle.eccc, bundle.ordinal() as usize)
        };

        let mut new_last = None;
        if priority == Priority::Urgent {
            if let Some(prev) = self.db.lists.prev(elt)? {
                let prev_obj = self.db.lists.data(prev)?;
                if self.db.bundle(prev_obj)?.ordinal() as usize == ordinal {
                    new_last = Some(prev);
                }
            }
        }
        self.db.lists.delete(elt)?;
        self.db.bundle_mut(obj)?.holders.plan = None;

        let plan = self.stage_plan(&key)?;
        let backlog = &mut plan.backlog[priority.index()];
        *backlog = backlog.saturating_sub(eccc);
        if priority == Priority::Urgent && ordinal < ORDINALS {
            let slot = &mut plan.ordinals[ordinal];
            slot.backlog = slot.backlog.saturating_sub(eccc);
            if slot.last == Some(elt) {
                slot.last = new_last;
            }
        }
        Ok(())
    }

    /// Park a bundle until a plan is unblocked. Critical bundles are never
    /// parked.
    pub(crate) fn enqueue_to_limbo(&mut self, obj: Object) -> Result<()> {
        let bundle = self.db.bundle_mut(obj)?;
        if bundle.is_critical() || bundle.holders.limbo.is_some() {
            return Ok(());
        }
        bundle.prox_node_eid = None;
        let elt = self.db.lists.insert_last(self.db.limbo, obj)?;
        self.db.bundle_mut(obj)?.holders.limbo = Some(elt);
        self.db.stats_mut().to_limbo += 1;
        tracing::debug!(bundle = %obj, "bundle parked in limbo");
        Ok(())
    }

    /// Pull a bundle back off its plan, then re-forward it or park it.
    pub fn reverse_enqueue(&mut self, obj: Object, to_limbo: bool) -> Result<()> {
        self.remove_from_queue(obj)?;
        let critical = {
            let bundle = self.db.bundle_mut(obj)?;
            bundle.prox_node_eid = None;
            bundle.is_critical()
        };
        if critical {
            return self.destroy(obj, false);
        }
        if to_limbo {
            self.cancel_overdue(obj)?;
            self.enqueue_to_limbo(obj)
        } else {
            self.reforward(obj)
        }
    }

    /// Block a plan: everything queued on it is re-forwarded, and the
    /// forwarder parks it in limbo while the plan stays blocked.
    pub fn block_plan(&mut self, key: &str) -> Result<()> {
        let queues = {
            let plan = self.stage_plan(key)?;
            plan.blocked = true;
            plan.queues
        };
        for priority in [Priority::Urgent, Priority::Standard, Priority::Bulk] {
            for (_, obj) in self.db.lists.to_vec(queues[priority.index()])? {
                self.reverse_enqueue(obj, false)?;
            }
        }
        tracing::info!(plan = key, "plan blocked");
        Ok(())
    }

    /// Unblock a plan and release every non-suspended bundle in limbo. A
    /// plan that is not blocked is left alone.
    pub fn unblock_plan(&mut self, key: &str) -> Result<()> {
        if !self.plan_checked(key)?.blocked {
            return Ok(());
        }
        self.stage_plan(key)?.blocked = false;
        let mut released = 0;
        for (elt, obj) in self.db.lists.to_vec(self.db.limbo)? {
            if self.db.bundle(obj)?.suspended {
                continue;
            }
            self.db.lists.delete(elt)?;
            self.db.bundle_mut(obj)?.holders.limbo = None;
            self.db.stats_mut().from_limbo += 1;
            self.reforward(obj)?;
            released += 1;
        }
        tracing::info!(plan = key, released, "plan unblocked");
        Ok(())
    }

    // ── Plan manager ──

    /// Next queued bundle: urgent first, then standard and bulk, either in
    /// strict priority or by least weighted service.
    fn select(&self, key: &str) -> Result<Option<Elt>> {
        let plan = self.plan_checked(key)?;
        let [bulk_q, std_q, urgent_q] = plan.queues;
        if let Some(elt) = self.db.lists.first(urgent_q)? {
            return Ok(Some(elt));
        }
        let std = self.db.lists.first(std_q)?;
        let bulk = self.db.lists.first(bulk_q)?;
        let (Some(s), Some(b)) = (std, bulk) else {
            return Ok(std.or(bulk));
        };
        if self.env.prior_claims == PriorClaims::Standard {
            return Ok(Some(s));
        }
        // Service weights: bulk 1, standard 2. Ties go to standard.
        let [bulk_bytes, std_bytes] = self.env.vdb.plan(key).map_or([0, 0], |v| {
            v.flow_bytes.lock().map(|f| *f).unwrap_or_default()
        });
        if bulk_bytes.saturating_mul(2) < std_bytes {
            Ok(Some(b))
        } else {
            Ok(Some(s))
        }
    }

    /// Move one bundle from a plan's queues to its outduct.
    pub fn plan_step(&mut self, key: &str) -> Result<PlanStep> {
        let vplan = self
            .env
            .vdb
            .plan(key)
            .ok_or_else(|| EngineError::UnknownPlan(key.to_string()))?;
        if !vplan.throttle().is_open() {
            return Ok(PlanStep::Throttled);
        }
        let Some(elt) = self.select(key)? else {
            return Ok(PlanStep::Idle);
        };
        let mut obj = self.db.lists.data(elt)?;

        let (duct_name, plan_max) = {
            let plan = self.plan_checked(key)?;
            (plan.outducts.first().cloned(), plan.max_payload_len)
        };
        let Some(duct_name) = duct_name else {
            tracing::warn!(plan = key, bundle = %obj, "plan has no outduct");
            self.reverse_enqueue(obj, true)?;
            return Ok(PlanStep::Parked);
        };
        let duct = self
            .db
            .outducts
            .get(&duct_name)
            .ok_or_else(|| EngineError::UnknownOutduct(duct_name.clone()))?;
        let xmit_buffer = duct.xmit_buffer;
        let max_payload = if duct.max_payload_len > 0 { duct.max_payload_len } else { plan_max };

        let (len, no_fragment) = {
            let bundle = self.db.bundle(obj)?;
            (bundle.payload.length, bundle.flags.has(BDL_DOES_NOT_FRAGMENT))
        };
        if max_payload > 0 && len > max_payload {
            if no_fragment {
                tracing::warn!(bundle = %obj, len, max_payload, "bundle too large and may not be fragmented");
                self.reverse_enqueue(obj, true)?;
                return Ok(PlanStep::Parked);
            }
            obj = self.split_for_duct(key, obj, max_payload)?;
        } else {
            self.remove_from_queue(obj)?;
        }

        let (priority, len, eccc) = {
            let bundle = self.db.bundle_mut(obj)?;
            bundle.eccc = compute_eccc(bundle.guess_size());
            bundle.prox_node_eid = Some(key.to_string());
            (bundle.priority(), bundle.payload.length, bundle.eccc)
        };
        let elt = self.db.lists.insert_last(xmit_buffer, obj)?;
        self.db.bundle_mut(obj)?.holders.duct = Some(elt);
        self.env.vdb.give_duct(&duct_name);

        let plan = self.stage_plan(key)?;
        plan.stats.dequeued_count += 1;
        plan.stats.dequeued_bytes += eccc;
        self.db.stats_mut().tally(StateStat::Xmit, priority, len);
        if let Ok(mut throttle) = vplan.throttle.lock() {
            throttle.consume(eccc);
        }
        if priority != Priority::Urgent {
            if let Ok(mut flows) = vplan.flow_bytes.lock() {
                flows[priority.index()] += eccc;
                let spread = flows[0].abs_diff(flows[1]);
                if spread > MAX_STARVATION * NOMINAL_BYTES_PER_SEC {
                    *flows = [0, 0];
                }
            }
        }
        tracing::debug!(bundle = %obj, plan = key, duct = %duct_name, "bundle handed to duct");
        Ok(PlanStep::Moved(obj))
    }

    /// Fragment a queued bundle so that its first part fits the duct. The
    /// remainder takes the original's place at the head of its queue.
    fn split_for_duct(&mut self, key: &str, obj: Object, max_payload: u64) -> Result<Object> {
        self.remove_from_queue(obj)?;
        self.db.bundle_mut(obj)?.prox_node_eid = None;
        let (first, rest) = self.fragment(obj, max_payload)?;

        let (priority, ordinal, eccc) = {
            let bundle = self.db.bundle_mut(rest)?;
            bundle.eccc = compute_eccc(bundle.guess_size());
            bundle.prox_node_eid = Some(key.to_string());
            (bundle.priority(), bundle.ordinal() as usize, bundle.eccc)
        };
        let queue = self.plan_checked(key)?.queues[priority.index()];
        let elt = self.db.lists.insert_first(queue, rest)?;
        self.db.bundle_mut(rest)?.holders.plan = Some(elt);

        let plan = self.stage_plan(key)?;
        plan.backlog[priority.index()] += eccc;
        if priority == Priority::Urgent {
            let slot = &mut plan.ordinals[ordinal];
            slot.backlog += eccc;
            if slot.last.is_none() {
                slot.last = Some(elt);
            }
        }
        Ok(first)
    }
}
