//! DTN time: seconds since 2000-01-01T00:00:00Z.

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix time of the DTN epoch.
pub const DTN_EPOCH_UNIX_SECS: u64 = 946_684_800;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DtnTime {
    pub seconds: u64,
    pub nanos: u32,
}

impl DtnTime {
    pub fn now() -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: since_unix.as_secs().saturating_sub(DTN_EPOCH_UNIX_SECS),
            nanos: since_unix.subsec_nanos(),
        }
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self { seconds, nanos: 0 }
    }
}

/// Bundle creation timestamp: DTN seconds plus a per-second sequence count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CreationTime {
    pub seconds: u64,
    pub count: u64,
}

impl std::fmt::Display for CreationTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.seconds, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_epoch() {
        // Anything built after 2020 is at least 20 years past the DTN epoch.
        assert!(DtnTime::now().seconds > 20 * 365 * 86_400);
    }

    #[test]
    fn creation_time_orders_by_seconds_then_count() {
        let a = CreationTime { seconds: 10, count: 5 };
        let b = CreationTime { seconds: 11, count: 1 };
        let c = CreationTime { seconds: 11, count: 2 };
        assert!(a < b && b < c);
        assert_eq!(c.to_string(), "11.2");
    }
}
