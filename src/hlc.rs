//! Hybrid logical clock.
//!
//! Stamps every Phase 1 insert with `(local, counter)`: `local` is wall-clock
//! seconds, `counter` disambiguates events inside one second. The clock never
//! regresses: when the wall clock jumps backwards, `local` is held and the
//! counter keeps incrementing until real time catches up, so receipt ordering
//! survives NTP steps and dead CMOS batteries on edge boxes.
//!
//! The OFD acknowledgement carries an authoritative server timestamp; it is
//! observed back into the clock so later local stamps sort after everything
//! the server has already confirmed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock seconds. Injectable so tests can regress time.
pub trait WallClock: Send + Sync {
    fn now_secs(&self) -> i64;
}

/// System clock in seconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A single HLC stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub local: i64,
    pub counter: i64,
}

/// Ordering key for two receipts per the buffer contract: confirmed receipts
/// compare by server time first; unconfirmed ones sort after all confirmed
/// receipts, by local origin.
pub fn sort_key(hlc_server: Option<i64>, local: i64, counter: i64) -> (i64, i64, i64) {
    (hlc_server.unwrap_or(i64::MAX), local, counter)
}

#[derive(Debug)]
struct HlcState {
    last_local: i64,
    last_counter: i64,
}

/// Process-wide clock. `now()` is linearizable: two calls in the same
/// process always yield strictly ordered stamps.
pub struct HybridLogicalClock {
    clock: Box<dyn WallClock>,
    state: Mutex<HlcState>,
}

impl HybridLogicalClock {
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemWallClock))
    }

    pub fn with_clock(clock: Box<dyn WallClock>) -> Self {
        HybridLogicalClock {
            clock,
            state: Mutex::new(HlcState {
                last_local: 0,
                last_counter: 0,
            }),
        }
    }

    /// Next stamp for a local event.
    pub fn now(&self) -> HlcTimestamp {
        let wall = self.clock.now_secs();
        let mut state = self.state.lock();

        if wall > state.last_local {
            state.last_local = wall;
            state.last_counter = 0;
        } else {
            // Wall clock stalled or regressed: hold `local`, advance counter.
            state.last_counter += 1;
        }

        HlcTimestamp {
            local: state.last_local,
            counter: state.last_counter,
        }
    }

    /// Fold an authoritative server timestamp (from an OFD acknowledgement)
    /// into the clock so subsequent local stamps sort after it.
    pub fn observe(&self, server_secs: i64) {
        let mut state = self.state.lock();
        if server_secs > state.last_local {
            state.last_local = server_secs;
            state.last_counter = 0;
        }
    }

    /// How far the logical clock has run ahead of the wall clock, in seconds.
    /// Zero in the healthy case; positive after a wall-clock regression.
    pub fn drift_secs(&self) -> i64 {
        let wall = self.clock.now_secs();
        let state = self.state.lock();
        (state.last_local - wall).max(0)
    }
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    /// Test clock whose reading is set explicitly.
    struct ManualClock(Arc<AtomicI64>);

    impl WallClock for ManualClock {
        fn now_secs(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn manual(start: i64) -> (Arc<AtomicI64>, HybridLogicalClock) {
        let t = Arc::new(AtomicI64::new(start));
        let hlc = HybridLogicalClock::with_clock(Box::new(ManualClock(t.clone())));
        (t, hlc)
    }

    #[test]
    fn test_counter_increments_within_same_second() {
        let (_t, hlc) = manual(1_000);
        let a = hlc.now();
        let b = hlc.now();
        assert_eq!(a, HlcTimestamp { local: 1_000, counter: 0 });
        assert_eq!(b, HlcTimestamp { local: 1_000, counter: 1 });
    }

    #[test]
    fn test_counter_resets_when_second_advances() {
        let (t, hlc) = manual(1_000);
        hlc.now();
        hlc.now();
        t.store(1_001, Ordering::SeqCst);
        let stamp = hlc.now();
        assert_eq!(stamp, HlcTimestamp { local: 1_001, counter: 0 });
    }

    #[test]
    fn test_monotonic_across_clock_regression() {
        // Wall clock regresses by five minutes; stamps keep ascending.
        let (t, hlc) = manual(10_000);
        let before = hlc.now();
        t.store(10_000 - 300, Ordering::SeqCst);

        let mut prev = before;
        for _ in 0..100 {
            let next = hlc.now();
            assert!(next > prev, "stamp regressed: {next:?} after {prev:?}");
            prev = next;
        }
        assert_eq!(prev.local, 10_000);
        assert_eq!(hlc.drift_secs(), 300);
    }

    #[test]
    fn test_observe_advances_past_server_time() {
        let (_t, hlc) = manual(1_000);
        hlc.now();
        hlc.observe(2_000);
        let stamp = hlc.now();
        assert_eq!(stamp.local, 2_000);
        // Wall clock still at 1_000, so counter path is taken next.
        assert_eq!(hlc.now(), HlcTimestamp { local: 2_000, counter: 2 });
    }

    #[test]
    fn test_observe_ignores_stale_server_time() {
        let (_t, hlc) = manual(5_000);
        let a = hlc.now();
        hlc.observe(100);
        let b = hlc.now();
        assert!(b > a);
        assert_eq!(b.local, 5_000);
    }

    #[test]
    fn test_concurrent_stamps_are_unique_and_ordered() {
        let hlc = Arc::new(HybridLogicalClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let hlc = hlc.clone();
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| hlc.now()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<HlcTimestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "duplicate HLC stamps issued");
    }

    #[test]
    fn test_sort_key_places_unconfirmed_last() {
        assert!(sort_key(Some(10), 999, 0) < sort_key(None, 1, 0));
        assert!(sort_key(None, 1, 0) < sort_key(None, 1, 1));
    }
}
