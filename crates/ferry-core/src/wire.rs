//! Bundle Protocol v6 wire format.
//!
//! A bundle is a primary block followed by one or more canonical blocks,
//! exactly one of which is the payload block. Every integer is an SDNV
//! except the version and block-type bytes. The last block carries
//! `BLK_IS_LAST`.
//!
//! The primary block:
//!   version (1 byte)
//!   processing flags
//!   residual block length (bytes remaining in the primary block)
//!   eight EID values: destination, source, report-to, custodian, each
//!     either (node, service) or (scheme offset, nss offset)
//!   creation seconds, creation count, lifetime, dictionary length
//!   dictionary bytes
//!   fragment offset, total ADU length   (only when IS_FRAGMENT)

use bytes::Bytes;

use crate::eid::{CbheEid, Dictionary, EidRef};
use crate::sdnv::{self, SdnvError};
use crate::time::CreationTime;

pub const BP_VERSION: u8 = 6;

/// Shortest primary block the parser will look at.
pub const MIN_PRIMARY_BLK_LENGTH: usize = 23;

// ── Bundle processing flags ──────────────────────────────────────────────────

pub const BDL_IS_FRAGMENT: u64 = 0x01;
pub const BDL_IS_ADMIN: u64 = 0x02;
pub const BDL_DOES_NOT_FRAGMENT: u64 = 0x04;
pub const BDL_IS_CUSTODIAL: u64 = 0x08;
pub const BDL_DEST_IS_SINGLETON: u64 = 0x10;
pub const BDL_APP_ACK_REQUEST: u64 = 0x20;

// ── Status report request flags (bits 14..20 of the processing flags) ───────

pub const SRR_RECEIVED: u8 = 0x01;
pub const SRR_CUSTODY_ACCEPTED: u8 = 0x02;
pub const SRR_FORWARDED: u8 = 0x04;
pub const SRR_DELIVERED: u8 = 0x08;
pub const SRR_DELETED: u8 = 0x10;

// ── Block processing flags ───────────────────────────────────────────────────

pub const BLK_MUST_BE_COPIED: u64 = 0x01;
pub const BLK_REPORT_IF_NG: u64 = 0x02;
pub const BLK_ABORT_IF_NG: u64 = 0x04;
pub const BLK_IS_LAST: u64 = 0x08;
pub const BLK_REMOVE_IF_NG: u64 = 0x10;
pub const BLK_FORWARDED_OPAQUE: u64 = 0x20;
pub const BLK_HAS_EID_REFERENCES: u64 = 0x40;

// ── Block types ──────────────────────────────────────────────────────────────

pub const PAYLOAD_BLOCK_TYPE: u8 = 1;

/// Extended class of service: flags byte, ordinal byte.
pub const ECOS_BLOCK_TYPE: u8 = 19;

/// ECOS flag: forward on every route, never reforward, never park in limbo.
pub const ECOS_MINIMUM_LATENCY: u8 = 0x01;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unsupported bundle protocol version {0}")]
    Version(u8),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("bad sdnv: {0}")]
    Sdnv(#[from] SdnvError),
    #[error("primary block residual length {declared} but {actual} bytes follow")]
    ResidualLength { declared: u64, actual: u64 },
    #[error("value {0} does not fit in memory")]
    TooLarge(u64),
    #[error("unknown administrative record type {0}")]
    UnknownAdminRecord(u8),
    #[error("malformed {0}")]
    Malformed(&'static str),
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Cursor over a borrowed buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn byte(&mut self, what: &'static str) -> Result<u8, WireError> {
        let b = *self.buf.get(self.pos).ok_or(WireError::Truncated(what))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn sdnv(&mut self, what: &'static str) -> Result<u64, WireError> {
        match sdnv::decode(&self.buf[self.pos..]) {
            Ok((value, used)) => {
                self.pos += used;
                Ok(value)
            }
            Err(SdnvError::Truncated(_)) => Err(WireError::Truncated(what)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn bytes(&mut self, len: u64, what: &'static str) -> Result<&'a [u8], WireError> {
        let len = usize::try_from(len).map_err(|_| WireError::TooLarge(len))?;
        if self.remaining() < len {
            return Err(WireError::Truncated(what));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }
}

// ── Priority ─────────────────────────────────────────────────────────────────

/// Class of service priority. The wire value 3 is reserved and treated as
/// urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Bulk = 0,
    Standard = 1,
    Urgent = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Bulk, Priority::Standard, Priority::Urgent];

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Priority::Bulk,
            1 => Priority::Standard,
            _ => Priority::Urgent,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Priority::Bulk => "bulk",
            Priority::Standard => "standard",
            Priority::Urgent => "urgent",
        })
    }
}

// ── Processing flags ─────────────────────────────────────────────────────────

/// Bundle processing flags: bundle bits 0..6, class of service 7..13,
/// status report requests 14..20.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProcFlags(pub u64);

impl ProcFlags {
    pub fn compose(bundle_bits: u64, class_of_service: u8, srr: u8) -> Self {
        Self((bundle_bits & 0x7f) | (u64::from(class_of_service & 0x7f) << 7) | (u64::from(srr & 0x7f) << 14))
    }

    pub fn has(self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u64) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u64) {
        self.0 &= !bit;
    }

    pub fn class_of_service(self) -> u8 {
        ((self.0 >> 7) & 0x7f) as u8
    }

    pub fn priority(self) -> Priority {
        Priority::from_bits(self.class_of_service())
    }

    pub fn srr(self) -> u8 {
        ((self.0 >> 14) & 0x7f) as u8
    }

    pub fn is_fragment(self) -> bool {
        self.has(BDL_IS_FRAGMENT)
    }

    pub fn is_admin(self) -> bool {
        self.has(BDL_IS_ADMIN)
    }

    pub fn is_custodial(self) -> bool {
        self.has(BDL_IS_CUSTODIAL)
    }
}

// ── Primary block ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub offset: u64,
    pub total_adu_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryBlock {
    pub flags: ProcFlags,
    pub destination: EidRef,
    pub source: EidRef,
    pub report_to: EidRef,
    pub custodian: EidRef,
    pub creation: CreationTime,
    pub lifetime: u64,
    /// Empty when every EID travels in CBHE form.
    pub dictionary: Dictionary,
    pub fragment: Option<FragmentInfo>,
}

impl PrimaryBlock {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(64);
        for eid in [&self.destination, &self.source, &self.report_to, &self.custodian] {
            let (a, b) = eid.values();
            sdnv::encode(a, &mut body);
            sdnv::encode(b, &mut body);
        }
        sdnv::encode(self.creation.seconds, &mut body);
        sdnv::encode(self.creation.count, &mut body);
        sdnv::encode(self.lifetime, &mut body);
        sdnv::encode(self.dictionary.len() as u64, &mut body);
        body.extend_from_slice(self.dictionary.as_bytes());
        if let Some(frag) = self.fragment {
            sdnv::encode(frag.offset, &mut body);
            sdnv::encode(frag.total_adu_length, &mut body);
        }

        let mut flags = self.flags;
        if self.fragment.is_some() {
            flags.set(BDL_IS_FRAGMENT);
        } else {
            flags.clear(BDL_IS_FRAGMENT);
        }

        out.push(BP_VERSION);
        sdnv::encode(flags.0, out);
        sdnv::encode(body.len() as u64, out);
        out.extend_from_slice(&body);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        if r.remaining() < MIN_PRIMARY_BLK_LENGTH {
            return Err(WireError::Truncated("primary block"));
        }
        let version = r.byte("version")?;
        if version != BP_VERSION {
            return Err(WireError::Version(version));
        }
        let flags = ProcFlags(r.sdnv("processing flags")?);
        let residual = r.sdnv("residual length")?;
        let body_start = r.position();

        let mut values = [0u64; 8];
        for v in values.iter_mut() {
            *v = r.sdnv("eid value")?;
        }
        let creation = CreationTime {
            seconds: r.sdnv("creation seconds")?,
            count: r.sdnv("creation count")?,
        };
        let lifetime = r.sdnv("lifetime")?;
        let dict_len = r.sdnv("dictionary length")?;
        let dictionary = Dictionary::from_bytes(r.bytes(dict_len, "dictionary")?.to_vec());

        let eid = |i: usize| {
            if dictionary.is_empty() {
                EidRef::Cbhe(CbheEid::new(values[i], values[i + 1]))
            } else {
                EidRef::Dict { scheme: values[i], nss: values[i + 1] }
            }
        };
        let (destination, source, report_to, custodian) = (eid(0), eid(2), eid(4), eid(6));

        let fragment = if flags.is_fragment() {
            Some(FragmentInfo {
                offset: r.sdnv("fragment offset")?,
                total_adu_length: r.sdnv("total adu length")?,
            })
        } else {
            None
        };

        let actual = (r.position() - body_start) as u64;
        if actual != residual {
            return Err(WireError::ResidualLength { declared: residual, actual });
        }

        Ok(Self {
            flags,
            destination,
            source,
            report_to,
            custodian,
            creation,
            lifetime,
            dictionary,
            fragment,
        })
    }
}

// ── Canonical blocks ─────────────────────────────────────────────────────────

/// Header of a canonical (non-primary) block; the data follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: u8,
    pub flags: u64,
    pub eid_refs: Vec<(u64, u64)>,
    pub data_length: u64,
}

impl BlockHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.block_type);
        let mut flags = self.flags;
        if self.eid_refs.is_empty() {
            flags &= !BLK_HAS_EID_REFERENCES;
        } else {
            flags |= BLK_HAS_EID_REFERENCES;
        }
        sdnv::encode(flags, out);
        if !self.eid_refs.is_empty() {
            sdnv::encode(self.eid_refs.len() as u64, out);
            for (scheme, nss) in &self.eid_refs {
                sdnv::encode(*scheme, out);
                sdnv::encode(*nss, out);
            }
        }
        sdnv::encode(self.data_length, out);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let block_type = r.byte("block type")?;
        let flags = r.sdnv("block flags")?;
        let mut eid_refs = Vec::new();
        if flags & BLK_HAS_EID_REFERENCES != 0 {
            let count = r.sdnv("eid reference count")?;
            for _ in 0..count {
                let scheme = r.sdnv("eid reference")?;
                let nss = r.sdnv("eid reference")?;
                eid_refs.push((scheme, nss));
            }
        }
        let data_length = r.sdnv("block data length")?;
        Ok(Self { block_type, flags, eid_refs, data_length })
    }

    pub fn is_last(&self) -> bool {
        self.flags & BLK_IS_LAST != 0
    }
}

/// An extension block carried opaquely or interpreted by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionBlock {
    pub block_type: u8,
    pub flags: u64,
    pub eid_refs: Vec<(u64, u64)>,
    pub data: Bytes,
}

impl ExtensionBlock {
    pub fn new(block_type: u8, flags: u64, data: Bytes) -> Self {
        Self { block_type, flags, eid_refs: Vec::new(), data }
    }

    pub fn header(&self, last: bool) -> BlockHeader {
        let mut flags = self.flags & !BLK_IS_LAST;
        if last {
            flags |= BLK_IS_LAST;
        }
        BlockHeader {
            block_type: self.block_type,
            flags,
            eid_refs: self.eid_refs.clone(),
            data_length: self.data.len() as u64,
        }
    }

    /// Encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        let mut tmp = Vec::new();
        self.header(false).encode(&mut tmp);
        tmp.len() + self.data.len()
    }

    pub fn encode(&self, last: bool, out: &mut Vec<u8>) {
        self.header(last).encode(out);
        out.extend_from_slice(&self.data);
    }
}

/// Extended class of service carried in an ECOS block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedCos {
    pub flags: u8,
    pub ordinal: u8,
}

impl ExtendedCos {
    pub fn is_critical(&self) -> bool {
        self.flags & ECOS_MINIMUM_LATENCY != 0
    }

    pub fn to_block(self) -> ExtensionBlock {
        ExtensionBlock::new(
            ECOS_BLOCK_TYPE,
            BLK_MUST_BE_COPIED,
            Bytes::copy_from_slice(&[self.flags, self.ordinal]),
        )
    }

    pub fn from_block_data(data: &[u8]) -> Result<Self, WireError> {
        match data {
            [flags, ordinal, ..] => Ok(Self { flags: *flags, ordinal: *ordinal }),
            _ => Err(WireError::Malformed("extended class of service block")),
        }
    }
}
