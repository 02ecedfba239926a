//! Administrative records: custody signals and bundle status reports.
//!
//! The first byte of an administrative payload carries the record type in
//! its high nibble and the "subject is a fragment" flag in bit 0.

use crate::sdnv;
use crate::time::{CreationTime, DtnTime};
use crate::wire::{
    Reader, WireError, SRR_CUSTODY_ACCEPTED, SRR_DELETED, SRR_DELIVERED, SRR_FORWARDED,
    SRR_RECEIVED,
};

pub const BP_STATUS_REPORT: u8 = 1;
pub const BP_CUSTODY_SIGNAL: u8 = 2;
pub const BP_ENCAPSULATED_BUNDLE: u8 = 3;
pub const BP_AGGREGATE_CUSTODY_SIGNAL: u8 = 4;
pub const BP_MULTICAST_PETITION: u8 = 5;
pub const BP_SAGA_MESSAGE: u8 = 6;

pub const ADMIN_IS_FRAGMENT: u8 = 0x01;

// ── Reason codes ─────────────────────────────────────────────────────────────

/// Why custody was refused, or `NoAdditionalInfo` on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtReason {
    NoAdditionalInfo = 0,
    RedundantReception = 3,
    DepletedStorage = 4,
    DestinationUnintelligible = 5,
    NoKnownRoute = 6,
    NoTimelyContact = 7,
    BlockUnintelligible = 8,
}

impl CtReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            3 => CtReason::RedundantReception,
            4 => CtReason::DepletedStorage,
            5 => CtReason::DestinationUnintelligible,
            6 => CtReason::NoKnownRoute,
            7 => CtReason::NoTimelyContact,
            8 => CtReason::BlockUnintelligible,
            _ => CtReason::NoAdditionalInfo,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SrReason {
    #[default]
    NoInfo = 0,
    LifetimeExpired = 1,
    UnidirectionalLink = 2,
    Canceled = 3,
    DepletedStorage = 4,
    DestinationUnintelligible = 5,
    NoKnownRoute = 6,
    NoTimelyContact = 7,
    BlockUnintelligible = 8,
}

impl SrReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SrReason::LifetimeExpired,
            2 => SrReason::UnidirectionalLink,
            3 => SrReason::Canceled,
            4 => SrReason::DepletedStorage,
            5 => SrReason::DestinationUnintelligible,
            6 => SrReason::NoKnownRoute,
            7 => SrReason::NoTimelyContact,
            8 => SrReason::BlockUnintelligible,
            _ => SrReason::NoInfo,
        }
    }
}

/// Fragment range of the bundle a record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectFragment {
    pub offset: u64,
    pub length: u64,
}

// ── Custody signal ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    pub succeeded: bool,
    pub reason: CtReason,
    pub fragment: Option<SubjectFragment>,
    pub signal_time: DtnTime,
    pub creation: CreationTime,
    pub source_eid: String,
}

impl CustodySignal {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.source_eid.len());
        let mut head = BP_CUSTODY_SIGNAL << 4;
        if self.fragment.is_some() {
            head |= ADMIN_IS_FRAGMENT;
        }
        out.push(head);
        out.push((self.reason as u8) | (u8::from(self.succeeded) << 7));
        if let Some(frag) = self.fragment {
            sdnv::encode(frag.offset, &mut out);
            sdnv::encode(frag.length, &mut out);
        }
        sdnv::encode(self.signal_time.seconds, &mut out);
        sdnv::encode(u64::from(self.signal_time.nanos), &mut out);
        sdnv::encode(self.creation.seconds, &mut out);
        sdnv::encode(self.creation.count, &mut out);
        sdnv::encode(self.source_eid.len() as u64, &mut out);
        out.extend_from_slice(self.source_eid.as_bytes());
        out
    }

    fn decode_body(r: &mut Reader<'_>, is_fragment: bool) -> Result<Self, WireError> {
        let head = r.byte("custody signal status")?;
        let fragment = if is_fragment {
            Some(SubjectFragment {
                offset: r.sdnv("fragment offset")?,
                length: r.sdnv("fragment length")?,
            })
        } else {
            None
        };
        let signal_time = DtnTime {
            seconds: r.sdnv("signal time")?,
            nanos: r.sdnv("signal time")? as u32,
        };
        let creation = CreationTime {
            seconds: r.sdnv("creation seconds")?,
            count: r.sdnv("creation count")?,
        };
        let eid_len = r.sdnv("source eid length")?;
        if r.remaining() as u64 != eid_len {
            return Err(WireError::Malformed("custody signal source eid"));
        }
        let source_eid = std::str::from_utf8(r.bytes(eid_len, "source eid")?)
            .map_err(|_| WireError::Malformed("custody signal source eid"))?
            .to_string();
        Ok(Self {
            succeeded: head & 0x80 != 0,
            reason: CtReason::from_code(head & 0x7f),
            fragment,
            signal_time,
            creation,
            source_eid,
        })
    }
}

// ── Status report ────────────────────────────────────────────────────────────

/// Bundle status report. Each time field is present on the wire only when
/// the matching flag is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub flags: u8,
    pub reason: SrReason,
    pub fragment: Option<SubjectFragment>,
    pub receipt_time: DtnTime,
    pub acceptance_time: DtnTime,
    pub forward_time: DtnTime,
    pub delivery_time: DtnTime,
    pub deletion_time: DtnTime,
    pub creation: CreationTime,
    pub source_eid: String,
}

impl StatusReport {
    fn times(&self) -> [(u8, DtnTime); 5] {
        [
            (SRR_RECEIVED, self.receipt_time),
            (SRR_CUSTODY_ACCEPTED, self.acceptance_time),
            (SRR_FORWARDED, self.forward_time),
            (SRR_DELIVERED, self.delivery_time),
            (SRR_DELETED, self.deletion_time),
        ]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + self.source_eid.len());
        let mut head = BP_STATUS_REPORT << 4;
        if self.fragment.is_some() {
            head |= ADMIN_IS_FRAGMENT;
        }
        out.push(head);
        out.push(self.flags);
        out.push(self.reason as u8);
        if let Some(frag) = self.fragment {
            sdnv::encode(frag.offset, &mut out);
            sdnv::encode(frag.length, &mut out);
        }
        for (flag, time) in self.times() {
            if self.flags & flag != 0 {
                sdnv::encode(time.seconds, &mut out);
                sdnv::encode(u64::from(time.nanos), &mut out);
            }
        }
        sdnv::encode(self.creation.seconds, &mut out);
        sdnv::encode(self.creation.count, &mut out);
        sdnv::encode(self.source_eid.len() as u64, &mut out);
        out.extend_from_slice(self.source_eid.as_bytes());
        out
    }

    fn decode_body(r: &mut Reader<'_>, is_fragment: bool) -> Result<Self, WireError> {
        let mut rpt = StatusReport {
            flags: r.byte("status flags")?,
            reason: SrReason::from_code(r.byte("status reason")?),
            ..Default::default()
        };
        if is_fragment {
            rpt.fragment = Some(SubjectFragment {
                offset: r.sdnv("fragment offset")?,
                length: r.sdnv("fragment length")?,
            });
        }
        let flags = rpt.flags;
        let mut read_time = |flag: u8| -> Result<DtnTime, WireError> {
            if flags & flag == 0 {
                return Ok(DtnTime::default());
            }
            Ok(DtnTime {
                seconds: r.sdnv("report time")?,
                nanos: r.sdnv("report time")? as u32,
            })
        };
        rpt.receipt_time = read_time(SRR_RECEIVED)?;
        rpt.acceptance_time = read_time(SRR_CUSTODY_ACCEPTED)?;
        rpt.forward_time = read_time(SRR_FORWARDED)?;
        rpt.delivery_time = read_time(SRR_DELIVERED)?;
        rpt.deletion_time = read_time(SRR_DELETED)?;
        rpt.creation = CreationTime {
            seconds: r.sdnv("creation seconds")?,
            count: r.sdnv("creation count")?,
        };
        let eid_len = r.sdnv("source eid length")?;
        if r.remaining() as u64 != eid_len {
            return Err(WireError::Malformed("status report source eid"));
        }
        rpt.source_eid = std::str::from_utf8(r.bytes(eid_len, "source eid")?)
            .map_err(|_| WireError::Malformed("status report source eid"))?
            .to_string();
        Ok(rpt)
    }
}

// ── Dispatch on record type ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRecord {
    StatusReport(StatusReport),
    CustodySignal(CustodySignal),
}

impl AdminRecord {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        let head = r.byte("administrative record type")?;
        let is_fragment = head & ADMIN_IS_FRAGMENT != 0;
        match head >> 4 {
            BP_STATUS_REPORT => Ok(AdminRecord::StatusReport(StatusReport::decode_body(
                &mut r,
                is_fragment,
            )?)),
            BP_CUSTODY_SIGNAL => Ok(AdminRecord::CustodySignal(CustodySignal::decode_body(
                &mut r,
                is_fragment,
            )?)),
            other => Err(WireError::UnknownAdminRecord(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            AdminRecord::StatusReport(r) => r.encode(),
            AdminRecord::CustodySignal(s) => s.encode(),
        }
    }
}
