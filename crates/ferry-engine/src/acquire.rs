//! Bundle acquisition: buffering bytes handed up by a convergence layer,
//! then parsing and admitting every bundle they contain.
//!
//! Buffering happens outside any transaction. Each chunk is admitted to
//! ZCO space first, in memory until the acquisition grows past its heap
//! threshold and in a spill file after that. Parsing and admission run in
//! one transaction at the end.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ferry_core::admin::{CtReason, SrReason, StatusReport};
use ferry_core::wire::{
    BlockHeader, ExtendedCos, ExtensionBlock, PrimaryBlock, Reader, WireError, ECOS_BLOCK_TYPE,
    PAYLOAD_BLOCK_TYPE, SRR_DELETED, SRR_RECEIVED,
};

use crate::bundle::{Bundle, BundleId, Found, Memberships, Payload};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::stats::{DelReason, StateStat};
use crate::zco::{Lease, Residence, SpillFile, Zco, ZcoSpace};

static ACQ_SEQ: AtomicU64 = AtomicU64::new(0);

// ── Work area ────────────────────────────────────────────────────────────────

enum Chunk {
    Heap(Bytes, Lease),
    File { offset: u64, len: u64, lease: Lease },
}

/// Bytes of one acquisition in progress.
pub struct AcqWorkArea {
    chunks: Vec<Chunk>,
    acquired: u64,
    congestive: bool,
    /// Wait for ZCO space instead of refusing.
    attendant: bool,
    threshold: u64,
    space: ZcoSpace,
    work_dir: PathBuf,
    spill: Option<SpillFile>,
    sender: Option<String>,
}

impl AcqWorkArea {
    pub fn new(
        space: ZcoSpace,
        threshold: u64,
        work_dir: PathBuf,
        sender: Option<String>,
        attendant: bool,
    ) -> Self {
        Self {
            chunks: Vec::new(),
            acquired: 0,
            congestive: false,
            attendant,
            threshold,
            space,
            work_dir,
            spill: None,
            sender,
        }
    }

    /// True once ZCO space has been refused. Later chunks are dropped, but
    /// what was already accepted is kept.
    pub fn is_congestive(&self) -> bool {
        self.congestive
    }

    pub fn len(&self) -> u64 {
        self.acquired
    }

    pub fn is_empty(&self) -> bool {
        self.acquired == 0
    }

    pub async fn continue_acq(&mut self, data: &[u8]) -> Result<()> {
        if self.congestive || data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let residence = if self.acquired + len <= self.threshold {
            Residence::Heap
        } else {
            Residence::File
        };
        let lease = if self.attendant {
            self.space.reserve(residence, len).await
        } else {
            self.space.try_reserve(residence, len)
        };
        let Some(lease) = lease else {
            tracing::warn!(len, acquired = self.acquired, residence = ?residence, "acquisition refused, congestive");
            self.congestive = true;
            return Ok(());
        };

        match residence {
            Residence::Heap => self.chunks.push(Chunk::Heap(Bytes::copy_from_slice(data), lease)),
            Residence::File => {
                let spill = match &mut self.spill {
                    Some(spill) => spill,
                    None => {
                        let name = format!(
                            "acq-{}-{}",
                            std::process::id(),
                            ACQ_SEQ.fetch_add(1, Ordering::Relaxed)
                        );
                        self.spill.insert(SpillFile::create(&self.work_dir, &name)?)
                    }
                };
                let offset = spill.append(data)?;
                self.chunks.push(Chunk::File { offset, len, lease });
            }
        }
        self.acquired += len;
        Ok(())
    }

    /// The acquired content, the sender and whether the acquisition was
    /// congestive.
    pub(crate) fn finish(self) -> (Zco, Option<String>, bool) {
        let spill = self.spill.map(Arc::new);
        let mut content = Zco::default();
        for chunk in self.chunks {
            match chunk {
                Chunk::Heap(bytes, lease) => content.push_heap(bytes, Some(lease)),
                Chunk::File { offset, len, lease } => {
                    if let Some(file) = &spill {
                        content.push_file(file.clone(), offset, len, Some(lease));
                    }
                }
            }
        }
        (content, self.sender, self.congestive)
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

struct Parsed {
    primary: PrimaryBlock,
    source: String,
    extensions: Vec<ExtensionBlock>,
    trailers: Vec<ExtensionBlock>,
    ecos: ExtendedCos,
    payload_offset: usize,
    payload_len: u64,
    /// Bytes consumed by this bundle.
    end: usize,
}

/// One bundle from the front of `buf`: primary block, blocks before the
/// payload, the payload, then blocks up to the one marked last.
fn parse_bundle(buf: &[u8]) -> Result<Parsed> {
    let mut r = Reader::new(buf);
    let primary = PrimaryBlock::decode(&mut r)?;
    let source = primary.dictionary.resolve(&primary.source)?;
    primary.dictionary.resolve(&primary.destination)?;

    let mut extensions = Vec::new();
    let mut trailers = Vec::new();
    let mut payload = None;
    loop {
        let header = BlockHeader::decode(&mut r)?;
        if header.block_type == PAYLOAD_BLOCK_TYPE {
            if payload.is_some() {
                return Err(WireError::Malformed("second payload block").into());
            }
            let at = r.position();
            r.bytes(header.data_length, "payload")?;
            payload = Some((at, header.data_length));
        } else {
            let data = Bytes::copy_from_slice(r.bytes(header.data_length, "extension block")?);
            let block = ExtensionBlock {
                block_type: header.block_type,
                flags: header.flags,
                eid_refs: header.eid_refs.clone(),
                data,
            };
            if payload.is_some() {
                trailers.push(block);
            } else {
                extensions.push(block);
            }
        }
        if header.is_last() {
            break;
        }
    }
    let (payload_offset, payload_len) =
        payload.ok_or(WireError::Malformed("bundle without payload block"))?;

    let ecos = match extensions.iter().find(|b| b.block_type == ECOS_BLOCK_TYPE) {
        Some(block) => ExtendedCos::from_block_data(&block.data)?,
        None => ExtendedCos::default(),
    };
    Ok(Parsed {
        primary,
        source,
        extensions,
        trailers,
        ecos,
        payload_offset,
        payload_len,
        end: r.position(),
    })
}

enum Admission {
    Accepted,
    Dropped,
    /// Stop parsing the stream.
    Stop,
}

impl Engine<'_> {
    /// Admit every bundle in an acquired stream. Returns how many were
    /// accepted. Malformed input ends the stream and is discarded.
    pub fn acquire(&mut self, content: Zco, sender: Option<&str>, congestive: bool) -> Result<usize> {
        let bytes = content.read()?;
        let mut offset = 0;
        let mut accepted = 0;
        while offset < bytes.len() {
            let parsed = match parse_bundle(&bytes[offset..]) {
                Ok(parsed) => parsed,
                Err(e @ (EngineError::Wire(_) | EngineError::Eid(_))) => {
                    let rest = (bytes.len() - offset) as u64;
                    tracing::warn!(sender, offset, error = %e, "malformed bundle discarded");
                    self.db.stats_mut().tally_deletion(DelReason::Unintelligible, rest);
                    break;
                }
                Err(e) => return Err(e),
            };
            let start = (offset + parsed.payload_offset) as u64;
            let payload = content.clone_range(start, parsed.payload_len).ok_or(
                EngineError::BadCloneRange {
                    offset: start,
                    length: parsed.payload_len,
                    payload: content.len(),
                },
            )?;
            offset += parsed.end;
            match self.admit(parsed, payload, sender, congestive)? {
                Admission::Accepted => accepted += 1,
                Admission::Dropped => {}
                Admission::Stop => break,
            }
        }
        Ok(accepted)
    }

    fn admit(
        &mut self,
        parsed: Parsed,
        content: Zco,
        sender: Option<&str>,
        congestive: bool,
    ) -> Result<Admission> {
        let now = self.now();
        let Parsed { primary, source, extensions, trailers, ecos, payload_len, .. } = parsed;
        let fragment = primary.fragment;
        let id = BundleId {
            source,
            creation: primary.creation,
            fragment_offset: fragment.map_or(0, |f| f.offset),
            fragment_length: if fragment.is_some() { payload_len } else { 0 },
        };
        let bundle = Bundle {
            status_rpt: StatusReport {
                creation: id.creation,
                source_eid: id.source.clone(),
                ..Default::default()
            },
            expiration: primary.creation.seconds + primary.lifetime,
            id,
            flags: primary.flags,
            destination: primary.destination,
            source: primary.source,
            report_to: primary.report_to,
            custodian: primary.custodian,
            dictionary: primary.dictionary,
            lifetime: primary.lifetime,
            total_adu_length: fragment.map_or(0, |f| f.total_adu_length),
            payload: Payload { length: payload_len, content },
            ecos,
            extensions,
            trailers,
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
        let (priority, srr, custodial) = (bundle.priority(), bundle.flags.srr(), bundle.flags.is_custodial());

        if congestive {
            tracing::warn!(bundle = %bundle.id, sender, "no space for acquisition, bundle refused");
            self.discard_received(
                bundle,
                custodial.then_some(CtReason::DepletedStorage),
                (srr & SRR_DELETED != 0).then_some(SrReason::DepletedStorage),
            )?;
            self.db.stats_mut().tally_deletion(DelReason::Depleted, payload_len);
            return Ok(Admission::Stop);
        }

        if bundle.expiration <= now.seconds {
            tracing::debug!(bundle = %bundle.id, sender, "bundle expired in transit");
            self.db.stats_mut().tally_deletion(DelReason::Expired, payload_len);
            return Ok(Admission::Dropped);
        }

        if custodial && self.holds_in_custody(&bundle.id) {
            tracing::debug!(bundle = %bundle.id, sender, "redundant reception");
            self.discard_received(bundle, Some(CtReason::RedundantReception), None)?;
            return Ok(Admission::Dropped);
        }

        let obj = self.db.new_object();
        self.db.bundles.insert(obj, bundle);
        self.set_ttl(obj)?;
        self.catalogue(obj)?;
        let stats = self.db.stats_mut();
        stats.note_inserted(payload_len);
        stats.tally(StateStat::Received, priority, payload_len);
        tracing::debug!(bundle = %obj, sender, len = payload_len, "bundle received");

        self.db.bundle_mut(obj)?.status_rpt.receipt_time = now;
        if srr & SRR_RECEIVED != 0 {
            self.send_status_report(obj, SRR_RECEIVED, SrReason::NoInfo)?;
        }
        self.dispatch(obj)?;
        Ok(Admission::Accepted)
    }

    /// Refuse a received bundle: send the custody refusal and deletion
    /// report it calls for, then drop it without storing it.
    fn discard_received(
        &mut self,
        bundle: Bundle,
        refusal: Option<CtReason>,
        report: Option<SrReason>,
    ) -> Result<()> {
        let obj = self.db.new_object();
        self.db.bundles.insert(obj, bundle);
        if let Some(reason) = refusal {
            self.send_ct_signal(obj, false, reason)?;
        }
        if let Some(reason) = report {
            self.send_status_report(obj, SRR_DELETED, reason)?;
        }
        self.db.bundles.remove(&obj);
        Ok(())
    }

    fn holds_in_custody(&self, id: &BundleId) -> bool {
        match self.find(id) {
            Found::Unique(obj) => self.db.bundle(obj).is_ok_and(|b| b.custody_taken),
            _ => false,
        }
    }
}
