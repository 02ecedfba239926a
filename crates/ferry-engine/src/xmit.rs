//! Convergence-layer handoff: taking bundles off a duct, serializing them
//! and resolving each transmission.

use bytes::Bytes;
use ferry_core::admin::SrReason;
use ferry_core::wire::{
    BlockHeader, FragmentInfo, PrimaryBlock, BLK_IS_LAST, PAYLOAD_BLOCK_TYPE, SRR_FORWARDED,
};

use crate::bundle::{BundleId, EventKind};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::stats::{DelReason, StateStat};
use crate::store::Object;

/// A bundle handed to a convergence-layer adapter. Exactly one of
/// `handle_xmit_success` or `handle_xmit_failure` must follow.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub bundle: Object,
    pub id: BundleId,
    pub bytes: Bytes,
}

impl Engine<'_> {
    /// Take the next transmittable bundle off a duct. Bundles that expired
    /// or went corrupt while waiting are destroyed on the way.
    pub fn dequeue(&mut self, duct: &str) -> Result<Option<Outbound>> {
        let buffer = self
            .db
            .outducts
            .get(&duct.to_string())
            .ok_or_else(|| EngineError::UnknownOutduct(duct.to_string()))?
            .xmit_buffer;
        let now = self.now().seconds;

        while let Some(elt) = self.db.lists.first(buffer)? {
            let obj = self.db.lists.delete(elt)?;
            let (stale, custody, priority, len) = {
                let bundle = self.db.bundle_mut(obj)?;
                bundle.holders.duct = None;
                self.env.hooks.extension.on_dequeue(bundle);
                (
                    bundle.corrupt || bundle.expiration <= now,
                    bundle.custody_taken,
                    bundle.priority(),
                    bundle.payload.length,
                )
            };
            if stale {
                tracing::debug!(bundle = %obj, duct, "stale bundle dropped at dequeue");
                self.db.stats_mut().tally(StateStat::Expired, priority, len);
                self.destroy(obj, true)?;
                continue;
            }

            self.cancel_overdue(obj)?;
            if self.env.xmit_overdue > 0 {
                let elt = self.arm_event(obj, EventKind::XmitOverdue, now + self.env.xmit_overdue)?;
                self.db.bundle_mut(obj)?.holders.overdue = Some(elt);
            }
            if custody && self.env.custody_timeout > 0 {
                self.memo(obj, self.env.custody_timeout)?;
            }
            let bytes = self.serialize(obj)?;
            let id = self.db.bundle(obj)?.id.clone();
            tracing::debug!(bundle = %obj, duct, len = bytes.len(), "bundle dequeued");
            return Ok(Some(Outbound { bundle: obj, id, bytes }));
        }
        Ok(None)
    }

    /// The bundle as it goes on the wire: primary block, pre-payload
    /// blocks, payload, then any post-payload blocks.
    pub fn serialize(&self, obj: Object) -> Result<Bytes> {
        let bundle = self.db.bundle(obj)?;
        let primary = PrimaryBlock {
            flags: bundle.flags,
            destination: bundle.destination,
            source: bundle.source,
            report_to: bundle.report_to,
            custodian: bundle.custodian,
            creation: bundle.id.creation,
            lifetime: bundle.lifetime,
            dictionary: bundle.dictionary.clone(),
            fragment: bundle.flags.is_fragment().then_some(FragmentInfo {
                offset: bundle.id.fragment_offset,
                total_adu_length: bundle.total_adu_length,
            }),
        };

        let mut out = Vec::with_capacity(bundle.guess_size() as usize + 16);
        primary.encode(&mut out);
        for block in &bundle.extensions {
            block.encode(false, &mut out);
        }
        BlockHeader {
            block_type: PAYLOAD_BLOCK_TYPE,
            flags: if bundle.trailers.is_empty() { BLK_IS_LAST } else { 0 },
            eid_refs: Vec::new(),
            data_length: bundle.payload.length,
        }
        .encode(&mut out);
        out.extend_from_slice(&bundle.payload.content.read()?);
        let last = bundle.trailers.len().saturating_sub(1);
        for (i, block) in bundle.trailers.iter().enumerate() {
            block.encode(i == last, &mut out);
        }
        Ok(Bytes::from(out))
    }

    /// The convergence layer sent the bundle. Returns false if the bundle
    /// had already gone.
    pub fn handle_xmit_success(&mut self, obj: Object) -> Result<bool> {
        let Some(bundle) = self.db.bundles.get(&obj) else {
            return Ok(false);
        };
        let (srr, custody, len) = (bundle.flags.srr(), bundle.custody_taken, bundle.payload.length);
        if srr & SRR_FORWARDED != 0 {
            self.send_status_report(obj, SRR_FORWARDED, SrReason::NoInfo)?;
        }
        self.cancel_overdue(obj)?;
        if !custody {
            self.db.stats_mut().tally_deletion(DelReason::Forwarded, len);
        }
        self.destroy(obj, false)?;
        Ok(true)
    }

    /// The convergence layer could not send the bundle: route it again.
    pub fn handle_xmit_failure(&mut self, obj: Object) -> Result<bool> {
        let Some(bundle) = self.db.bundles.get(&obj) else {
            return Ok(false);
        };
        let (priority, len) = (bundle.priority(), bundle.payload.length);
        self.cancel_overdue(obj)?;
        self.db.stats_mut().tally(StateStat::Requeued, priority, len);
        tracing::debug!(bundle = %obj, "transmission failed, re-forwarding");
        self.reforward(obj)?;
        Ok(true)
    }
}
