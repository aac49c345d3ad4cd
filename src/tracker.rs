//! Message deduplication cache.
//!
//! Each fingerprint is remembered for a fixed time-to-live. A second sighting
//! within that window is a duplicate (a network echo or the same packet heard
//! by two radios) and must not be forwarded again. Memory is bounded: when the
//! cache is full the entry that was first seen earliest is evicted.

use crate::message::Fingerprint;
use ahash::AHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default time a fingerprint stays "seen".
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
/// Default maximum number of tracked fingerprints.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

// Stand-in expiry for TTLs that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry(start: Instant, ttl: Duration) -> Instant {
    start
        .checked_add(ttl)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Bookkeeping for one tracked fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedEntry {
    pub fingerprint: Fingerprint,
    pub first_seen_at: Instant,
    pub expires_at: Instant,
}

/// Deduplication cache keyed by message fingerprint.
///
/// Not synchronized: the dispatcher task owns it and calls [`seen_at`]
/// sequentially, which is what makes check-and-insert atomic.
///
/// [`seen_at`]: MessageTracker::seen_at
pub struct MessageTracker {
    ttl: Duration,
    max_entries: usize,
    entries: AHashMap<Fingerprint, TrackedEntry>,
    /// Insertion order, i.e. ascending `first_seen_at`. May hold stale
    /// positions for fingerprints that were re-inserted after expiry.
    order: VecDeque<(Fingerprint, Instant)>,
}

impl Default for MessageTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl MessageTracker {
    /// Creates a tracker. A `max_entries` of zero is treated as one.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            ttl,
            max_entries,
            entries: AHashMap::with_capacity(max_entries.min(4096)),
            order: VecDeque::with_capacity(max_entries.min(4096)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the record for a fingerprint.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&TrackedEntry> {
        self.entries.get(fingerprint)
    }

    /// [`seen_at`](Self::seen_at) using the current time.
    pub fn seen(&mut self, fingerprint: Fingerprint) -> bool {
        self.seen_at(fingerprint, Instant::now())
    }

    /// Records `fingerprint` and returns `true` if it is new (or its earlier
    /// record has expired). Returns `false` for a duplicate; the original
    /// expiry is left untouched.
    pub fn seen_at(&mut self, fingerprint: Fingerprint, now: Instant) -> bool {
        self.sweep(now);

        if let Some(entry) = self.entries.get(&fingerprint) {
            if entry.expires_at > now {
                return false;
            }
            // Expired but not yet swept (sweep only walks the queue front).
            self.entries.remove(&fingerprint);
        }

        while self.entries.len() >= self.max_entries {
            if !self.evict_oldest() {
                break;
            }
        }

        self.entries.insert(
            fingerprint,
            TrackedEntry {
                fingerprint,
                first_seen_at: now,
                expires_at: expiry(now, self.ttl),
            },
        );
        self.order.push_back((fingerprint, now));
        true
    }

    /// Removes every entry with `expires_at <= now`. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();

        // Fast path: entries are queued by first_seen_at, and with a uniform
        // TTL the front also expires first.
        while let Some(&(fingerprint, first_seen)) = self.order.front() {
            match self.entries.get(&fingerprint) {
                Some(entry) if entry.first_seen_at == first_seen => {
                    if entry.expires_at <= now {
                        self.entries.remove(&fingerprint);
                        self.order.pop_front();
                    } else {
                        break;
                    }
                }
                // Stale queue position.
                _ => {
                    self.order.pop_front();
                }
            }
        }

        before - self.entries.len()
    }

    /// Applies new limits. Entries already tracked keep their expiry; if the
    /// new capacity is smaller the oldest entries are evicted.
    pub fn reconfigure(&mut self, ttl: Duration, max_entries: usize) {
        self.ttl = ttl;
        self.max_entries = max_entries.max(1);
        while self.entries.len() > self.max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
        // Clamp to the new TTL (never extend). The queue stays ordered by
        // expiry since both old and clamped expiries ascend with first_seen_at.
        for entry in self.entries.values_mut() {
            entry.expires_at = entry.expires_at.min(expiry(entry.first_seen_at, ttl));
        }
        self.sweep(Instant::now());
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((fingerprint, first_seen)) = self.order.pop_front() {
            let live = matches!(
                self.entries.get(&fingerprint),
                Some(entry) if entry.first_seen_at == first_seen
            );
            if live {
                self.entries.remove(&fingerprint);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint(n)
    }

    #[test]
    fn test_first_sighting_then_duplicate() {
        let mut tracker = MessageTracker::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();

        assert!(tracker.seen_at(fp(1), t0));
        assert!(!tracker.seen_at(fp(1), t0 + Duration::from_secs(1)));
        assert!(!tracker.seen_at(fp(1), t0 + Duration::from_secs(59)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_duplicate_does_not_extend_expiry() {
        let mut tracker = MessageTracker::new(Duration::from_secs(10), 10);
        let t0 = Instant::now();

        assert!(tracker.seen_at(fp(7), t0));
        assert!(!tracker.seen_at(fp(7), t0 + Duration::from_secs(9)));
        let entry = *tracker.get(&fp(7)).expect("tracked");
        assert_eq!(entry.expires_at, t0 + Duration::from_secs(10));

        // Exactly at expiry the fingerprint counts as new again.
        assert!(tracker.seen_at(fp(7), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_new_again_after_ttl() {
        let mut tracker = MessageTracker::new(Duration::from_millis(100), 10);
        let t0 = Instant::now();

        assert!(tracker.seen_at(fp(3), t0));
        assert!(tracker.seen_at(fp(3), t0 + Duration::from_millis(150)));
        assert!(!tracker.seen_at(fp(3), t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_capacity_evicts_oldest_first_seen() {
        let mut tracker = MessageTracker::new(Duration::from_secs(600), 3);
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(tracker.seen_at(fp(i), t0 + Duration::from_secs(i)));
        }
        // A duplicate of the oldest does not refresh its position.
        assert!(!tracker.seen_at(fp(0), t0 + Duration::from_secs(4)));

        assert!(tracker.seen_at(fp(10), t0 + Duration::from_secs(5)));
        assert_eq!(tracker.len(), 3);
        assert!(tracker.get(&fp(0)).is_none(), "oldest must be evicted");
        assert!(tracker.get(&fp(1)).is_some());
        assert!(tracker.get(&fp(10)).is_some());
    }

    #[test]
    fn test_size_never_exceeds_max() {
        let mut tracker = MessageTracker::new(Duration::from_secs(600), 50);
        let t0 = Instant::now();
        for i in 0..1000u64 {
            tracker.seen_at(fp(i), t0 + Duration::from_millis(i));
            assert!(tracker.len() <= 50);
        }
        assert_eq!(tracker.len(), 50);
        assert!(tracker.get(&fp(949)).is_none());
        assert!(tracker.get(&fp(950)).is_some());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let mut tracker = MessageTracker::new(Duration::from_secs(30), 100);
        let t0 = Instant::now();
        tracker.seen_at(fp(1), t0);
        tracker.seen_at(fp(2), t0 + Duration::from_secs(10));
        tracker.seen_at(fp(3), t0 + Duration::from_secs(20));

        assert_eq!(tracker.sweep(t0 + Duration::from_secs(35)), 1);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(60)), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reinsert_after_expiry_leaves_no_stale_eviction() {
        let mut tracker = MessageTracker::new(Duration::from_secs(10), 2);
        let t0 = Instant::now();

        tracker.seen_at(fp(1), t0);
        tracker.seen_at(fp(1), t0 + Duration::from_secs(11));
        tracker.seen_at(fp(2), t0 + Duration::from_secs(12));
        tracker.seen_at(fp(3), t0 + Duration::from_secs(13));

        // fp(1)'s stale queue slot must not cause fp(2) to survive wrongly.
        assert_eq!(tracker.len(), 2);
        assert!(tracker.get(&fp(1)).is_none());
        assert!(tracker.get(&fp(2)).is_some());
        assert!(tracker.get(&fp(3)).is_some());
    }

    #[test]
    fn test_unbounded_ttl_saturates() {
        let mut tracker = MessageTracker::new(Duration::MAX, 10);
        let t0 = Instant::now();

        assert!(tracker.seen_at(fp(1), t0));
        assert!(!tracker.seen_at(fp(1), t0 + Duration::from_secs(3600)));
        let entry = *tracker.get(&fp(1)).expect("tracked");
        assert!(entry.expires_at > t0 + Duration::from_secs(365 * 24 * 60 * 60));

        tracker.reconfigure(Duration::from_secs(u64::MAX), 10);
        assert!(!tracker.seen_at(fp(1), t0 + Duration::from_secs(7200)));
        assert_eq!(tracker.sweep(t0 + Duration::from_secs(7200)), 0);
    }

    #[test]
    fn test_reconfigure_shrinks_capacity() {
        let mut tracker = MessageTracker::new(Duration::from_secs(600), 10);
        let t0 = Instant::now();
        for i in 0..10 {
            tracker.seen_at(fp(i), t0);
        }
        tracker.reconfigure(Duration::from_secs(600), 4);
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.max_entries(), 4);
        assert!(tracker.get(&fp(9)).is_some());
    }
}
