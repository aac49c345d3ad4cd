//! Relay statistics.
//!
//! [`Statistics`] is the process-scoped aggregation sink: constructed once by
//! the relay, shared by reference, updated with atomic increments from the
//! dispatcher and supervisor tasks. Counters are independently accurate; no
//! cross-counter consistency is implied by a snapshot.
//!
//! [`StatsHistory`] keeps periodic snapshots for windowed rate reporting.

use crate::events::DropReason;
use crate::filter::RuleKindTag;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Shared counters and gauges.
pub struct Statistics {
    started_at: Instant,
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_filtered: AtomicU64,
    send_errors: AtomicU64,
    blocked_by_node: AtomicU64,
    blocked_by_content: AtomicU64,
    blocked_by_channel: AtomicU64,
    connected_endpoints: AtomicUsize,
    tracked_fingerprints: AtomicUsize,
    processed: AtomicU64,
    total_processing_us: AtomicU64,
    max_processing_us: AtomicU64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped_duplicate: AtomicU64::new(0),
            dropped_filtered: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            blocked_by_node: AtomicU64::new(0),
            blocked_by_content: AtomicU64::new(0),
            blocked_by_channel: AtomicU64::new(0),
            connected_endpoints: AtomicUsize::new(0),
            tracked_fingerprints: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            total_processing_us: AtomicU64::new(0),
            max_processing_us: AtomicU64::new(0),
        }
    }

    pub fn on_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// One successful delivery to one target.
    pub fn on_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_dropped(&self, reason: &DropReason) {
        match reason {
            DropReason::Duplicate => {
                self.dropped_duplicate.fetch_add(1, Ordering::Relaxed);
            }
            DropReason::Filtered { kind, .. } => {
                self.dropped_filtered.fetch_add(1, Ordering::Relaxed);
                let by_kind = match kind {
                    Some(RuleKindTag::Node) => Some(&self.blocked_by_node),
                    Some(RuleKindTag::Content) => Some(&self.blocked_by_content),
                    Some(RuleKindTag::Channel) => Some(&self.blocked_by_channel),
                    None => None,
                };
                if let Some(counter) = by_kind {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn on_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected_endpoints(&self, count: usize) {
        self.connected_endpoints.store(count, Ordering::Relaxed);
    }

    pub fn set_tracked_fingerprints(&self, count: usize) {
        self.tracked_fingerprints.store(count, Ordering::Relaxed);
    }

    /// Time the dispatcher spent on one message, fan-out included.
    pub fn record_processing_time(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_us.fetch_add(us, Ordering::Relaxed);
        self.max_processing_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn connected_endpoints(&self) -> usize {
        self.connected_endpoints.load(Ordering::Relaxed)
    }

    pub fn tracked_fingerprints(&self) -> usize {
        self.tracked_fingerprints.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_us = self.total_processing_us.load(Ordering::Relaxed);
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_filtered: self.dropped_filtered.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            blocked_by_node: self.blocked_by_node.load(Ordering::Relaxed),
            blocked_by_content: self.blocked_by_content.load(Ordering::Relaxed),
            blocked_by_channel: self.blocked_by_channel.load(Ordering::Relaxed),
            connected_endpoints: self.connected_endpoints(),
            tracked_fingerprints: self.tracked_fingerprints(),
            avg_processing_us: if processed == 0 { 0 } else { total_us / processed },
            max_processing_us: self.max_processing_us.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

/// Point-in-time copy of all statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub dropped_duplicate: u64,
    pub dropped_filtered: u64,
    pub send_errors: u64,
    pub blocked_by_node: u64,
    pub blocked_by_content: u64,
    pub blocked_by_channel: u64,
    pub connected_endpoints: usize,
    pub tracked_fingerprints: usize,
    pub avg_processing_us: u64,
    pub max_processing_us: u64,
    pub uptime_secs: u64,
    /// Seconds since UNIX epoch when the snapshot was taken.
    pub timestamp: u64,
}

/// Rolling buffer of snapshots.
pub struct StatsHistory {
    /// Recent samples, oldest first
    pub samples: VecDeque<StatsSnapshot>,
    /// Max retention time in seconds
    pub max_age_secs: u64,
}

impl StatsHistory {
    pub fn new(max_age_secs: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_age_secs.min(4096) as usize),
            max_age_secs,
        }
    }

    /// Add sample and drop samples older than `max_age_secs`.
    pub fn push(&mut self, snapshot: StatsSnapshot) {
        self.samples.push_back(snapshot);

        if let Some(latest) = self.samples.back() {
            let cutoff = latest.timestamp.saturating_sub(self.max_age_secs);
            while let Some(oldest) = self.samples.front() {
                if oldest.timestamp < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Rates over the last `window_secs`, computed from the first and last
    /// sample inside the window.
    pub fn aggregate(&self, window_secs: u64) -> Option<AggregatedStats> {
        let latest = self.samples.back()?;
        let cutoff = latest.timestamp.saturating_sub(window_secs);

        // Timestamps ascend, so the window start can be found by bisection.
        let start_idx = self.samples.partition_point(|s| s.timestamp < cutoff);
        let first = self.samples.get(start_idx)?;
        let sample_count = self.samples.len() - start_idx;

        let elapsed = latest.timestamp.saturating_sub(first.timestamp);
        let rate = |from: u64, to: u64| {
            if elapsed == 0 {
                0.0
            } else {
                to.saturating_sub(from) as f64 / elapsed as f64
            }
        };

        Some(AggregatedStats {
            received_per_sec: rate(first.received, latest.received),
            forwarded_per_sec: rate(first.forwarded, latest.forwarded),
            dropped: (latest.dropped_duplicate + latest.dropped_filtered)
                .saturating_sub(first.dropped_duplicate + first.dropped_filtered),
            send_errors: latest.send_errors.saturating_sub(first.send_errors),
            sample_count,
        })
    }
}

/// Aggregated view of a history window.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedStats {
    pub received_per_sec: f64,
    pub forwarded_per_sec: f64,
    /// Messages dropped (duplicate or filtered) within the window
    pub dropped: u64,
    pub send_errors: u64,
    pub sample_count: usize,
}
