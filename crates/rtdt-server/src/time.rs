//! Lock-free timestamps and Unix time helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// An `Option<Instant>` that can be read and swapped atomically.
///
/// Stored as nanoseconds past a base instant plus one, so zero means unset.
/// Instants earlier than the base clamp to the base.
#[derive(Debug)]
pub(crate) struct AtomicTime {
    base: Instant,
    nanos: AtomicU64,
}

impl AtomicTime {
    pub(crate) fn new(base: Instant) -> Self {
        Self {
            base,
            nanos: AtomicU64::new(0),
        }
    }

    pub(crate) fn with_value(base: Instant, t: Instant) -> Self {
        let this = Self::new(base);
        this.store(t);
        this
    }

    fn encode(&self, t: Instant) -> u64 {
        let d = t.saturating_duration_since(self.base).as_nanos();
        u64::try_from(d).unwrap_or(u64::MAX - 1) + 1
    }

    fn decode(&self, v: u64) -> Option<Instant> {
        (v != 0).then(|| self.base + Duration::from_nanos(v - 1))
    }

    pub(crate) fn load(&self) -> Option<Instant> {
        self.decode(self.nanos.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, t: Instant) {
        self.nanos.store(self.encode(t), Ordering::Release);
    }

    /// Store `t`, returning the previous value.
    pub(crate) fn swap(&self, t: Instant) -> Option<Instant> {
        self.decode(self.nanos.swap(self.encode(t), Ordering::AcqRel))
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_then_store() {
        let base = Instant::now();
        let t = AtomicTime::new(base);
        assert!(t.load().is_none());

        let later = base + Duration::from_millis(5);
        t.store(later);
        assert_eq!(t.load(), Some(later));
    }

    #[test]
    fn test_swap_returns_previous() {
        let base = Instant::now();
        let t = AtomicTime::new(base);
        assert_eq!(t.swap(base), None);

        let later = base + Duration::from_secs(1);
        assert_eq!(t.swap(later), Some(base));
        assert_eq!(t.load(), Some(later));
    }

    #[test]
    fn test_before_base_clamps() {
        let early = Instant::now();
        let base = early + Duration::from_millis(10);
        let t = AtomicTime::with_value(base, early);
        assert_eq!(t.load(), Some(base));
    }

    #[test]
    fn test_unix_now_is_recent() {
        assert!(unix_now() > 1_600_000_000);
    }
}
