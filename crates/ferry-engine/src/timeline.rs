//! Timed events: TTL expiry, custody-signal timeouts and overdue
//! transmissions.

use crate::bundle::{EventKind, TimelineEvent};
use crate::engine::Engine;
use crate::error::Result;
use crate::stats::StateStat;
use crate::store::{Elt, Object};

impl Engine<'_> {
    pub(crate) fn arm_event(&mut self, obj: Object, kind: EventKind, time: u64) -> Result<Elt> {
        Ok(self.db.insert_event(TimelineEvent { time, object: obj, kind })?)
    }

    /// Schedule the bundle's expiration.
    pub fn set_ttl(&mut self, obj: Object) -> Result<()> {
        let expiration = self.db.bundle(obj)?.expiration;
        let elt = self.arm_event(obj, EventKind::ExpiredTtl, expiration)?;
        self.db.bundle_mut(obj)?.holders.ttl = Some(elt);
        Ok(())
    }

    /// Remove the bundle's pending transmission-overdue event, if any.
    pub(crate) fn cancel_overdue(&mut self, obj: Object) -> Result<()> {
        if let Some(elt) = self.db.bundle_mut(obj)?.holders.overdue.take() {
            self.db.destroy_event(elt)?;
        }
        Ok(())
    }

    /// Handle one due event. The event is always removed.
    pub fn process_event(&mut self, elt: Elt, event: TimelineEvent) -> Result<()> {
        self.db.destroy_event(elt)?;
        let obj = event.object;
        let Some(bundle) = self.db.bundles.stage(&obj) else {
            tracing::debug!(object = %obj, kind = ?event.kind, "event for a vanished bundle");
            return Ok(());
        };
        match event.kind {
            EventKind::ExpiredTtl => {
                bundle.holders.ttl = None;
                let (priority, len) = (bundle.priority(), bundle.payload.length);
                self.db.stats_mut().tally(StateStat::Expired, priority, len);
                tracing::debug!(bundle = %obj, "bundle expired");
                self.destroy(obj, true)
            }
            EventKind::CtDue => {
                bundle.holders.ct_due = None;
                tracing::debug!(bundle = %obj, "custody signal overdue");
                self.reforward(obj)
            }
            EventKind::XmitOverdue => {
                bundle.holders.overdue = None;
                tracing::debug!(bundle = %obj, "transmission overdue");
                self.reforward(obj)
            }
        }
    }
}
