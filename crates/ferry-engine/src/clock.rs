//! Time source for creation stamps, expiration and the timeline.

use std::sync::atomic::{AtomicU64, Ordering};

use ferry_core::DtnTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> DtnTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DtnTime {
        DtnTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicU64,
}

impl ManualClock {
    pub fn new(seconds: u64) -> Self {
        Self { seconds: AtomicU64::new(seconds) }
    }

    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DtnTime {
        DtnTime::from_seconds(self.seconds.load(Ordering::SeqCst))
    }
}
