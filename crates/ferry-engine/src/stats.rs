//! Engine counters, kept in the store so they commit with the work they
//! count.

use ferry_core::Priority;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub count: u64,
    pub bytes: u64,
}

impl Tally {
    fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }
}

/// Per-class counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStat {
    Source,
    Received,
    Forward,
    Xmit,
    Delivered,
    Expired,
    Requeued,
    Abandoned,
    CustodyAccepted,
    CustodyReleased,
    CustodyRefused,
}

const STATE_COUNT: usize = 11;

/// Why a bundle was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelReason {
    Expired,
    Forwarded,
    Unintelligible,
    NoRoute,
    Depleted,
}

const DEL_COUNT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// `[state][priority]`.
    states: [[Tally; 3]; STATE_COUNT],
    deleted: [Tally; DEL_COUNT],
    pub to_limbo: u64,
    pub from_limbo: u64,
    pub fragments_produced: u64,
    pub bundles_fragmented: u64,
    pub forward_failed: u64,
    /// Bundles currently stored and their payload bytes.
    pub current: Tally,
}

impl Stats {
    pub fn tally(&mut self, state: StateStat, priority: Priority, bytes: u64) {
        self.states[state as usize][priority.index()].add(bytes);
    }

    pub fn tally_deletion(&mut self, reason: DelReason, bytes: u64) {
        self.deleted[reason as usize].add(bytes);
    }

    pub fn state(&self, state: StateStat, priority: Priority) -> Tally {
        self.states[state as usize][priority.index()]
    }

    /// Sum over all classes.
    pub fn total(&self, state: StateStat) -> Tally {
        self.states[state as usize].iter().fold(Tally::default(), |acc, t| Tally {
            count: acc.count + t.count,
            bytes: acc.bytes + t.bytes,
        })
    }

    pub fn deleted(&self, reason: DelReason) -> Tally {
        self.deleted[reason as usize]
    }

    pub fn note_inserted(&mut self, bytes: u64) {
        self.current.add(bytes);
    }

    pub fn note_removed(&mut self, bytes: u64) {
        self.current.count = self.current.count.saturating_sub(1);
        self.current.bytes = self.current.bytes.saturating_sub(bytes);
    }

    pub fn log(&self) {
        tracing::info!(
            sourced = self.total(StateStat::Source).count,
            received = self.total(StateStat::Received).count,
            forwarded = self.total(StateStat::Forward).count,
            transmitted = self.total(StateStat::Xmit).count,
            delivered = self.total(StateStat::Delivered).count,
            expired = self.total(StateStat::Expired).count,
            requeued = self.total(StateStat::Requeued).count,
            abandoned = self.total(StateStat::Abandoned).count,
            custody_accepted = self.total(StateStat::CustodyAccepted).count,
            custody_released = self.total(StateStat::CustodyReleased).count,
            custody_refused = self.total(StateStat::CustodyRefused).count,
            "bundle state stats"
        );
        tracing::info!(
            expired = self.deleted(DelReason::Expired).count,
            forwarded = self.deleted(DelReason::Forwarded).count,
            unintelligible = self.deleted(DelReason::Unintelligible).count,
            no_route = self.deleted(DelReason::NoRoute).count,
            depleted = self.deleted(DelReason::Depleted).count,
            in_limbo = self.to_limbo.saturating_sub(self.from_limbo),
            fragments = self.fragments_produced,
            stored_bundles = self.current.count,
            stored_bytes = self.current.bytes,
            "bundle discard stats"
        );
    }
}
