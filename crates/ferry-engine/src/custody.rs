//! Custody transfer and administrative records: custody signals, status
//! reports and the embargo bookkeeping driven by custody refusals.

use bytes::Bytes;
use ferry_core::admin::{AdminRecord, CtReason, CustodySignal, SrReason, SubjectFragment};
use ferry_core::eid::{EidRef, NULL_EID};
use ferry_core::wire::{
    SRR_CUSTODY_ACCEPTED, SRR_DELETED, SRR_DELIVERED, SRR_FORWARDED, SRR_RECEIVED,
};
use ferry_core::{Dictionary, MetaEid, Priority};

use crate::bundle::{BundleId, EventKind, Found};
use crate::engine::Engine;
use crate::error::Result;
use crate::send::SendRequest;
use crate::stats::{DelReason, StateStat};
use crate::store::Object;
use crate::vdb::Snub;
use crate::zco::{Residence, Zco};

impl Engine<'_> {
    // ── Custody ──

    /// Become the bundle's custodian, telling the previous one.
    pub fn take_custody(&mut self, obj: Object) -> Result<()> {
        self.send_ct_signal(obj, true, CtReason::NoAdditionalInfo)?;
        let now = self.now();
        let custodian = MetaEid::parse(&self.env.custodian_eid)?;

        let bundle = self.db.bundle_mut(obj)?;
        bundle.custody_taken = true;
        if bundle.flags.srr() & SRR_CUSTODY_ACCEPTED != 0 {
            bundle.status_rpt.flags |= SRR_CUSTODY_ACCEPTED;
            bundle.status_rpt.acceptance_time = now;
        }
        match custodian.numeric {
            Some(c) if bundle.dictionary.is_empty() => bundle.custodian = EidRef::Cbhe(c),
            _ => rebuild_dictionary(bundle, &custodian)?,
        }
        self.env.hooks.extension.on_take_custody(bundle);

        let (priority, len) = (bundle.priority(), bundle.payload.length);
        self.db.stats_mut().tally(StateStat::CustodyAccepted, priority, len);
        tracing::debug!(bundle = %obj, "custody accepted");
        Ok(())
    }

    pub fn release_custody(&mut self, obj: Object) -> Result<()> {
        let bundle = self.db.bundle_mut(obj)?;
        bundle.custody_taken = false;
        let (priority, len) = (bundle.priority(), bundle.payload.length);
        if let Some(elt) = bundle.holders.ct_due.take() {
            self.db.destroy_event(elt)?;
        }
        self.db.stats_mut().tally(StateStat::CustodyReleased, priority, len);
        tracing::debug!(bundle = %obj, "custody released");
        Ok(())
    }

    /// Re-forward the bundle unless a custody signal arrives within
    /// `secs`.
    pub fn memo(&mut self, obj: Object, secs: u64) -> Result<()> {
        if let Some(elt) = self.db.bundle_mut(obj)?.holders.ct_due.take() {
            self.db.destroy_event(elt)?;
        }
        let due = self.now().seconds + secs;
        let elt = self.arm_event(obj, EventKind::CtDue, due)?;
        self.db.bundle_mut(obj)?.holders.ct_due = Some(elt);
        Ok(())
    }

    // ── Outbound records ──

    /// Signal the bundle's current custodian.
    pub fn send_ct_signal(&mut self, obj: Object, succeeded: bool, reason: CtReason) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        let custodian = bundle.custodian_eid()?;
        if custodian == NULL_EID || bundle.is_anonymous() {
            return Ok(());
        }
        let signal = CustodySignal {
            succeeded,
            reason,
            fragment: subject_fragment(bundle),
            signal_time: self.now(),
            creation: bundle.id.creation,
            source_eid: bundle.id.source.clone(),
        };
        let lifetime = record_lifetime(bundle);
        if self.env.hooks.aggregator.absorb(&custodian, &signal) {
            return Ok(());
        }
        tracing::debug!(bundle = %obj, custodian = %custodian, succeeded, reason = ?reason, "custody signal");
        let record = AdminRecord::CustodySignal(signal).encode();
        self.send_admin(&custodian, record, lifetime, Priority::Urgent)
    }

    /// Report to the bundle's report-to endpoint. Times not yet recorded
    /// for the asserted flags are stamped now.
    pub fn send_status_report(&mut self, obj: Object, flags: u8, reason: SrReason) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        let report_to = bundle.report_to_eid()?;
        if report_to == NULL_EID || bundle.is_anonymous() {
            return Ok(());
        }
        let now = self.now();
        let mut report = bundle.status_rpt.clone();
        report.flags = flags;
        report.reason = reason;
        report.fragment = subject_fragment(bundle);
        let stamps = [
            (SRR_RECEIVED, &mut report.receipt_time),
            (SRR_CUSTODY_ACCEPTED, &mut report.acceptance_time),
            (SRR_FORWARDED, &mut report.forward_time),
            (SRR_DELIVERED, &mut report.delivery_time),
            (SRR_DELETED, &mut report.deletion_time),
        ];
        for (flag, time) in stamps {
            if flags & flag != 0 && *time == Default::default() {
                *time = now;
            }
        }
        let lifetime = record_lifetime(bundle);
        let record = AdminRecord::StatusReport(report).encode();
        self.send_admin(&report_to, record, lifetime, Priority::Standard)
    }

    /// Originate an administrative bundle from the custodial endpoint.
    /// Without heap space the record is dropped.
    pub(crate) fn send_admin(
        &mut self,
        destination: &str,
        record: Vec<u8>,
        lifetime: u64,
        priority: Priority,
    ) -> Result<()> {
        let Some(lease) = self.env.space.try_reserve(Residence::Heap, record.len() as u64) else {
            tracing::warn!(destination, len = record.len(), "no space for administrative record");
            return Ok(());
        };
        let mut req = SendRequest::new(self.env.custodian_eid.clone(), destination, lifetime);
        req.admin = true;
        req.priority = priority;
        self.send(&req, Zco::from_heap(Bytes::from(record), Some(lease)))?;
        Ok(())
    }

    // ── Inbound records ──

    /// Consume an administrative bundle addressed to this node.
    pub(crate) fn handle_admin(&mut self, obj: Object) -> Result<()> {
        let bundle = self.db.bundle(obj)?;
        let (sender, len, dest) =
            (bundle.id.source.clone(), bundle.payload.length, bundle.destination_eid()?);
        let payload = bundle.payload.content.read()?;
        match AdminRecord::parse(&payload) {
            Ok(AdminRecord::CustodySignal(signal)) => {
                self.apply_ct_signal(&signal, &sender)?;
            }
            Ok(AdminRecord::StatusReport(_)) => {
                if self.db.endpoints.contains(&dest) {
                    self.deliver(obj, &dest)?;
                }
            }
            Err(e) => {
                tracing::warn!(bundle = %obj, sender = %sender, error = %e, "unintelligible administrative record");
                self.db.stats_mut().tally_deletion(DelReason::Unintelligible, len);
            }
        }
        self.destroy(obj, false)
    }

    /// Act on a custody signal from `sender` about a bundle this node
    /// holds.
    pub fn apply_ct_signal(&mut self, signal: &CustodySignal, sender: &str) -> Result<()> {
        let id = BundleId {
            source: signal.source_eid.clone(),
            creation: signal.creation,
            fragment_offset: signal.fragment.map_or(0, |f| f.offset),
            fragment_length: signal.fragment.map_or(0, |f| f.length),
        };
        let Found::Unique(obj) = self.find(&id) else {
            tracing::debug!(bundle = %id, sender, "custody signal for unknown bundle");
            return Ok(());
        };
        let bundle = self.db.bundle(obj)?;
        let destination = MetaEid::parse(&bundle.destination_eid()?)?;
        let (priority, len, critical, taken) =
            (bundle.priority(), bundle.payload.length, bundle.is_critical(), bundle.custody_taken);
        let neighbor = MetaEid::parse(sender).ok().and_then(|m| m.node());
        let snub = match (destination.node(), neighbor) {
            (Some(destination), Some(neighbor)) => Some(Snub { destination, neighbor }),
            _ => None,
        };

        if signal.succeeded || signal.reason == CtReason::RedundantReception {
            if let Some(snub) = snub {
                if self.env.vdb.snubs.remove(&snub).is_some() {
                    self.env.hooks.contact_graph.snub_forgotten(&snub);
                }
            }
            if taken {
                self.release_custody(obj)?;
            }
            return self.destroy(obj, false);
        }

        self.db.stats_mut().tally(StateStat::CustodyRefused, priority, len);
        tracing::info!(bundle = %obj, sender, reason = ?signal.reason, "custody refused");
        if let Some(snub) = snub.filter(|_| destination.is_cbhe() && !critical) {
            if self.env.vdb.snubs.insert(snub) {
                self.env.hooks.contact_graph.snub_added(&snub);
            }
        }
        self.reforward(obj)
    }
}

fn subject_fragment(bundle: &crate::bundle::Bundle) -> Option<SubjectFragment> {
    bundle.flags.is_fragment().then_some(SubjectFragment {
        offset: bundle.id.fragment_offset,
        length: bundle.payload.length,
    })
}

/// Records live as long as the bundle they describe had left, at least a
/// second.
fn record_lifetime(bundle: &crate::bundle::Bundle) -> u64 {
    bundle.expiration.saturating_sub(bundle.id.creation.seconds).max(1)
}

/// Rewrite the dictionary with the local custodian, keeping every other
/// reference (extension blocks included) pointing at the same strings.
fn rebuild_dictionary(bundle: &mut crate::bundle::Bundle, custodian: &MetaEid) -> Result<()> {
    let mut eids = vec![
        MetaEid::parse(&bundle.destination_eid()?)?,
        MetaEid::parse(&bundle.source_eid()?)?,
        MetaEid::parse(&bundle.report_to_eid()?)?,
        custodian.clone(),
    ];
    for block in bundle.extensions.iter().chain(bundle.trailers.iter()) {
        for &(scheme, nss) in &block.eid_refs {
            let text = bundle.dictionary.resolve(&EidRef::Dict { scheme, nss })?;
            eids.push(MetaEid::parse(&text)?);
        }
    }
    let refs: Vec<&MetaEid> = eids.iter().collect();
    let (dictionary, mut resolved) = Dictionary::build(&refs);
    let mut blocks = resolved.split_off(4).into_iter();
    for block in bundle.extensions.iter_mut().chain(bundle.trailers.iter_mut()) {
        for slot in block.eid_refs.iter_mut() {
            if let Some(r) = blocks.next() {
                *slot = r.values();
            }
        }
    }
    if let [destination, source, report_to, custodian] = resolved[..] {
        bundle.destination = destination;
        bundle.source = source;
        bundle.report_to = report_to;
        bundle.custodian = custodian;
    }
    bundle.dictionary = dictionary;
    Ok(())
}
