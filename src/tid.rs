use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const FRACTION_BITS: u32 = 32;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Transaction identifier. Doubles as the commit timestamp of
/// the transaction: the high 32 bits are whole seconds since the
/// unix epoch, the low 32 bits are the binary fraction of a second.
///
/// Committed TIDs are strictly increasing in file order. When the
/// clock has not advanced past the previous TID (or has gone
/// backwards), the next TID is the previous one plus one.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tid(u64);

impl Tid {
    /// The null serial, used as the expected serial when an
    /// object is stored for the first time.
    pub const ZERO: Tid = Tid(0);
    pub const MAX: Tid = Tid(u64::MAX);

    pub const fn from_u64(raw: u64) -> Tid {
        Tid(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Tid {
        Tid(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// A TID for the current wall-clock time.
    pub fn now() -> Tid {
        Tid::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Tid {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = since_epoch.as_secs().min(u64::from(u32::MAX));
        let fraction = (u64::from(since_epoch.subsec_nanos()) << FRACTION_BITS) / NANOS_PER_SEC;
        Tid((secs << FRACTION_BITS) | fraction)
    }

    pub fn to_system_time(&self) -> SystemTime {
        let secs = self.0 >> FRACTION_BITS;
        let fraction = self.0 & u64::from(u32::MAX);
        let nanos = (fraction * NANOS_PER_SEC) >> FRACTION_BITS;
        UNIX_EPOCH + Duration::new(secs, nanos as u32)
    }

    /// Seconds since the unix epoch as a float, for display.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / (1_u64 << FRACTION_BITS) as f64
    }

    /// The smallest TID that sorts after this one.
    pub fn next(&self) -> Tid {
        Tid(self.0.saturating_add(1))
    }

    /// The largest TID that sorts before this one.
    pub fn prev(&self) -> Tid {
        Tid(self.0.saturating_sub(1))
    }

    /// Returns `self` if it is strictly greater than `prev`,
    /// otherwise the TID immediately following `prev`.
    pub fn later_than(self, prev: Tid) -> Tid {
        if self > prev {
            self
        } else {
            prev.next()
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({:016x})", self.0)
    }
}
