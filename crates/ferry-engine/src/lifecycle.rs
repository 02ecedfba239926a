//! Bundle destruction and abandonment.

use ferry_core::admin::{CtReason, SrReason};
use ferry_core::wire::SRR_DELETED;

use crate::engine::Engine;
use crate::error::Result;
use crate::stats::{DelReason, StateStat};
use crate::store::Object;

impl Engine<'_> {
    /// Destroy a bundle once nothing holds it any more.
    ///
    /// With `ttl_expired` every queue membership is severed first, the
    /// deletion is reported and custody is given up. Otherwise this is a
    /// no-op while the bundle is still queued anywhere, in custody, or
    /// detained by an application.
    pub fn destroy(&mut self, obj: Object, ttl_expired: bool) -> Result<()> {
        if !self.db.bundles.contains(&obj) {
            return Ok(());
        }
        if ttl_expired {
            self.sever(obj)?;
            let bundle = self.db.bundle(obj)?;
            let (srr, custodial, taken, anonymous) = (
                bundle.flags.srr(),
                bundle.flags.is_custodial(),
                bundle.custody_taken,
                bundle.is_anonymous(),
            );
            let len = bundle.payload.length;
            self.db.stats_mut().tally_deletion(DelReason::Expired, len);
            if srr & SRR_DELETED != 0 {
                self.send_status_report(obj, SRR_DELETED, SrReason::LifetimeExpired)?;
            }
            if taken {
                self.release_custody(obj)?;
            } else if custodial && !anonymous {
                self.send_ct_signal(obj, false, CtReason::NoTimelyContact)?;
            }
        }

        let bundle = self.db.bundle(obj)?;
        let holders = bundle.holder_set();
        if !holders.is_empty() {
            tracing::debug!(bundle = %obj, held_by = %holders, "bundle retained");
            return Ok(());
        }

        let events = [bundle.holders.ttl, bundle.holders.ct_due, bundle.holders.overdue];
        let len = bundle.payload.length;
        for elt in events.into_iter().flatten() {
            self.db.destroy_event(elt)?;
        }
        self.uncatalogue(obj)?;
        self.db.bundles.remove(&obj);
        self.db.stats_mut().note_removed(len);
        tracing::debug!(bundle = %obj, len, "bundle destroyed");
        Ok(())
    }

    /// Cut the bundle out of every queue it sits in.
    fn sever(&mut self, obj: Object) -> Result<()> {
        self.remove_from_queue(obj)?;
        let holders = {
            let bundle = self.db.bundle_mut(obj)?;
            bundle.prox_node_eid = None;
            let m = &mut bundle.holders;
            [
                m.forward.take(),
                m.delivery.take(),
                m.transit.take(),
                m.limbo.take(),
                m.duct.take(),
            ]
        };
        for elt in holders.into_iter().flatten() {
            self.db.lists.delete(elt)?;
        }
        self.leave_incomplete(obj)?;
        Ok(())
    }

    /// Give up on a bundle that cannot be forwarded.
    pub fn abandon(&mut self, obj: Object, reason: DelReason) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        let (priority, len, srr) = (bundle.priority(), bundle.payload.length, bundle.flags.srr());
        let (custodial, taken, anonymous) =
            (bundle.flags.is_custodial(), bundle.custody_taken, bundle.is_anonymous());
        tracing::warn!(bundle = %obj, reason = ?reason, "bundle abandoned");

        let stats = self.db.stats_mut();
        stats.forward_failed += 1;
        stats.tally(StateStat::Abandoned, priority, len);

        let (sr_reason, ct_reason) = match reason {
            DelReason::Depleted => (SrReason::DepletedStorage, CtReason::DepletedStorage),
            _ => (SrReason::NoKnownRoute, CtReason::NoKnownRoute),
        };
        if srr & SRR_DELETED != 0 {
            self.send_status_report(obj, SRR_DELETED, sr_reason)?;
        }
        if taken {
            self.release_custody(obj)?;
        } else if custodial && !anonymous {
            self.send_ct_signal(obj, false, ct_reason)?;
        }
        self.db.stats_mut().tally_deletion(reason, len);
        self.destroy(obj, false)
    }

    pub fn purge_stations(&mut self, obj: Object) -> Result<()> {
        self.db.bundle_mut(obj)?.stations.clear();
        Ok(())
    }
}
