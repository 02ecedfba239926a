//! Bundle origination.

use ferry_core::admin::StatusReport;
use ferry_core::eid::{EidRef, NULL_EID};
use ferry_core::wire::{
    ExtendedCos, BDL_DEST_IS_SINGLETON, BDL_DOES_NOT_FRAGMENT, BDL_IS_ADMIN, BDL_IS_CUSTODIAL,
    ECOS_MINIMUM_LATENCY,
};
use ferry_core::{Dictionary, MetaEid, Priority, ProcFlags};

use crate::bundle::{Bundle, BundleId, Memberships, Payload};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::stats::StateStat;
use crate::store::Object;
use crate::zco::Zco;

/// What an application (or the engine itself) asks to send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// `None` sends anonymously.
    pub source: Option<String>,
    pub destination: String,
    pub report_to: Option<String>,
    /// Seconds.
    pub lifetime: u64,
    pub priority: Priority,
    pub ordinal: u8,
    /// Minimum latency: forwarded on every route, never parked in limbo.
    pub critical: bool,
    pub custody: bool,
    /// Status report request flags (`SRR_*`).
    pub srr: u8,
    pub do_not_fragment: bool,
    pub admin: bool,
}

impl SendRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, lifetime: u64) -> Self {
        Self {
            source: Some(source.into()),
            destination: destination.into(),
            report_to: None,
            lifetime,
            priority: Priority::Standard,
            ordinal: 0,
            critical: false,
            custody: false,
            srr: 0,
            do_not_fragment: false,
            admin: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(EngineError::InvalidSend("no destination"));
        }
        if self.lifetime == 0 {
            return Err(EngineError::InvalidSend("lifetime must be positive"));
        }
        let anonymous = self.source.as_deref().map_or(true, |s| s == NULL_EID);
        if anonymous && (self.custody || self.srr != 0) {
            return Err(EngineError::InvalidSend("anonymous bundles cannot request custody or reports"));
        }
        if self.admin && (self.custody || self.srr != 0) {
            return Err(EngineError::InvalidSend("administrative records cannot request custody or reports"));
        }
        Ok(())
    }
}

/// CBHE references when every EID allows it, else a dictionary.
pub(crate) fn encode_eids(eids: [&MetaEid; 4]) -> (Dictionary, [EidRef; 4]) {
    let compressible = eids.iter().all(|e| e.null || e.is_cbhe());
    if compressible {
        let refs = eids.map(|e| match e.numeric {
            Some(c) if !e.null => EidRef::Cbhe(c),
            _ => EidRef::NULL,
        });
        return (Dictionary::default(), refs);
    }
    let (dictionary, refs) = Dictionary::build(&eids);
    let mut out = [EidRef::NULL; 4];
    for (slot, r) in out.iter_mut().zip(refs) {
        *slot = r;
    }
    (dictionary, out)
}

impl Engine<'_> {
    /// Create a bundle and start forwarding it. Returns `None` when the
    /// destination is the null endpoint and the content was dropped.
    pub fn send(&mut self, req: &SendRequest, content: Zco) -> Result<Option<Object>> {
        req.validate()?;
        let destination = MetaEid::parse(&req.destination)?;
        if destination.null {
            tracing::debug!(len = content.len(), "bundle for the null endpoint dropped");
            return Ok(None);
        }
        let source = MetaEid::parse(req.source.as_deref().unwrap_or(NULL_EID))?;
        let report_to = match &req.report_to {
            Some(eid) => MetaEid::parse(eid)?,
            None => source.clone(),
        };
        let custodian = MetaEid::parse(NULL_EID)?;
        let (dictionary, [dest_ref, source_ref, report_ref, custodian_ref]) =
            encode_eids([&destination, &source, &report_to, &custodian]);

        let mut bits = 0;
        if !self.env.hooks.multicast.is_group(&destination) {
            bits |= BDL_DEST_IS_SINGLETON;
        }
        if req.custody {
            bits |= BDL_IS_CUSTODIAL;
        }
        if req.admin {
            bits |= BDL_IS_ADMIN;
        }
        if req.do_not_fragment {
            bits |= BDL_DOES_NOT_FRAGMENT;
        }
        let flags = ProcFlags::compose(bits, req.priority.into(), req.srr);

        let ecos = ExtendedCos {
            flags: if req.critical { ECOS_MINIMUM_LATENCY } else { 0 },
            ordinal: if req.priority == Priority::Urgent { req.ordinal } else { 0 },
        };
        let extensions = if ecos == ExtendedCos::default() { Vec::new() } else { vec![ecos.to_block()] };

        let now = self.now();
        let creation = self.db.next_creation_time(now.seconds);
        let id = BundleId {
            source: source.to_string(),
            creation,
            fragment_offset: 0,
            fragment_length: 0,
        };
        let length = content.len();
        let bundle = Bundle {
            status_rpt: StatusReport {
                creation,
                source_eid: id.source.clone(),
                ..Default::default()
            },
            id,
            flags,
            destination: dest_ref,
            source: source_ref,
            report_to: report_ref,
            custodian: custodian_ref,
            dictionary,
            lifetime: req.lifetime,
            expiration: creation.seconds + req.lifetime,
            total_adu_length: 0,
            payload: Payload { length, content },
            ecos,
            extensions,
            trailers: Vec::new(),
            stations: Vec::new(),
            prox_node_eid: None,
            enqueue_time: 0,
            eccc: 0,
            custody_taken: false,
            accepted: false,
            delivered: false,
            detained: false,
            suspended: false,
            corrupt: false,
            catalogued: false,
            arrival: now,
            holders: Memberships::default(),
        };
        let priority = bundle.priority();

        let obj = self.db.new_object();
        self.db.bundles.insert(obj, bundle);
        self.catalogue(obj)?;
        self.set_ttl(obj)?;
        let stats = self.db.stats_mut();
        stats.note_inserted(length);
        stats.tally(StateStat::Source, priority, length);
        tracing::debug!(bundle = %obj, destination = %req.destination, len = length, "bundle sourced");

        self.forward_bundle(obj, &destination.to_string())?;
        Ok(Some(obj))
    }
}
