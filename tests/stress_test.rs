#![allow(clippy::unwrap_used)]

//! Stress and reliability tests

use meshrelay::endpoints::memory::MemoryEndpoint;
use meshrelay::filter::{FilterAction, FilterChain, FilterRule, RuleKind};
use meshrelay::message::{EndpointId, Fingerprint, FingerprintMode, InboundEvent, Message};
use meshrelay::tracker::MessageTracker;
use meshrelay::Relay;
use serial_test::serial;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Helper to determine stress test iterations based on environment
#[allow(clippy::expect_used)]
fn stress_iterations() -> usize {
    if let Ok(s) = env::var("CI_STRESS_ITERATIONS") {
        return s.parse().expect("CI_STRESS_ITERATIONS must be a number");
    }

    let cpus = num_cpus::get();
    if cpus >= 64 {
        5_000_000
    } else if cpus >= 8 {
        1_000_000
    } else if cpus >= 4 {
        500_000
    } else {
        100_000
    }
}

#[test]
fn test_tracker_memory_actually_bounded() {
    let mut tracker = MessageTracker::new(Duration::from_secs(600), 1000);
    let iterations = stress_iterations();
    println!(
        "Running test_tracker_memory_actually_bounded with {} iterations",
        iterations
    );

    let now = Instant::now();
    for i in 0..iterations {
        assert!(tracker.seen_at(Fingerprint(i as u64), now));
        assert!(tracker.len() <= 1000);
    }
    assert_eq!(tracker.len(), 1000);

    // Only the newest fingerprints survive eviction.
    let newest = Fingerprint((iterations - 1) as u64);
    assert!(!tracker.seen_at(newest, now));
    assert!(tracker.seen_at(Fingerprint(0), now));
}

#[test]
fn test_tracker_sweep_under_churn() {
    let mut tracker = MessageTracker::new(Duration::from_millis(100), 10_000);
    let start = Instant::now();
    let iterations = stress_iterations().min(200_000);

    for i in 0..iterations {
        // Advance a virtual clock by 1ms every 100 messages.
        let now = start + Duration::from_millis((i / 100) as u64);
        tracker.seen_at(Fingerprint(i as u64), now);
        if i % 1000 == 0 {
            tracker.sweep(now);
        }
    }

    let end = start + Duration::from_millis((iterations / 100) as u64);
    tracker.sweep(end);
    // 100ms of traffic at 100 messages per ms.
    assert!(tracker.len() <= 10_000);
}

#[test]
fn test_filter_chain_evaluation_stress() {
    let rules = (0..50)
        .map(|i| {
            FilterRule::new(
                format!("keyword-{}", i),
                RuleKind::Keyword {
                    pattern: format!("spam{}", i),
                },
                FilterAction::Block,
                i,
            )
        })
        .chain(std::iter::once(FilterRule::new(
            "regex",
            RuleKind::Regex {
                pattern: r"^buy\s+now".into(),
            },
            FilterAction::Block,
            0,
        )))
        .collect();
    let chain = FilterChain::new(rules, FilterAction::Allow);
    assert_eq!(chain.active_rules(), 51);

    let blocked = message("please no spam42 here");
    let allowed = message("weather is fine on channel zero");

    let iterations = stress_iterations() / 10;
    for _ in 0..iterations {
        assert!(chain.evaluate(&blocked).is_blocked());
        assert!(!chain.evaluate(&allowed).is_blocked());
    }
}

#[tokio::test]
async fn test_filter_chain_concurrent_swap() {
    use parking_lot::RwLock;

    let chain = Arc::new(RwLock::new(Arc::new(FilterChain::allow_all())));
    let probe = Arc::new(message("blocked word"));

    let mut handles = vec![];

    // Writers add rules while readers keep evaluating.
    for i in 0..10 {
        let chain = chain.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..100 {
                let mut guard = chain.write();
                let updated = guard.with_rule(FilterRule::new(
                    format!("rule-{}-{}", i, j),
                    RuleKind::Keyword {
                        pattern: format!("word{}", j),
                    },
                    FilterAction::Block,
                    0,
                ));
                *guard = Arc::new(updated);
            }
        }));
    }

    for _ in 0..10 {
        let chain = chain.clone();
        let probe = probe.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                let snapshot = chain.read().clone();
                assert!(!snapshot.evaluate(&probe).is_blocked());
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(chain.read().active_rules(), 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_relay_burst_delivered_once_per_target() {
    const BURST: usize = 2000;

    let relay = Relay::from_str("[general]\nstats_log_interval_secs = 0\n[tracker]\nmax_entries = 10000").await.unwrap();
    let mut mesh = Vec::new();
    for id in ["a", "b", "c"] {
        let (endpoint, handle) = MemoryEndpoint::new(id);
        relay.add_endpoint(Arc::new(endpoint)).unwrap();
        mesh.push(handle);
    }
    for _ in 0..500 {
        if relay.stats().connected_endpoints == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.stats().connected_endpoints, 3);

    // Every packet is heard twice, once by each of two radios.
    for i in 0..BURST as u32 {
        mesh[0].inject_text(i, "!node1", 0, "burst");
        mesh[1].inject_text(i, "!node1", 0, "burst");
    }

    assert!(mesh[2].wait_for_sent(BURST, Duration::from_secs(30)).await);
    // Let any stray duplicates drain before counting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = relay.stats();
    assert_eq!(stats.received, (BURST * 2) as u64);
    assert_eq!(stats.dropped_duplicate, BURST as u64);
    assert_eq!(mesh[2].sent_count(), BURST);
    assert_eq!(mesh[0].sent_count() + mesh[1].sent_count(), BURST);
    relay.stop().await;
}

fn message(text: &str) -> Message {
    Message::from_event(
        EndpointId::from("radio"),
        InboundEvent::text(1, "!node1", 0, text),
        FingerprintMode::default(),
    )
}
