#![allow(clippy::unwrap_used)]

//! Endpoint lifecycle tests, driven by the paused tokio clock.

use meshrelay::endpoint::{Capabilities, ChannelConfig};
use meshrelay::endpoints::memory::{MemoryEndpoint, MemoryHandle};
use meshrelay::error::RelayError;
use meshrelay::events::EventSink;
use meshrelay::message::{EndpointId, InboundEvent};
use meshrelay::stats::Statistics;
use meshrelay::supervisor::{EndpointStatus, EndpointSupervisor, SupervisorConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StatusLog {
    transitions: Mutex<Vec<(EndpointStatus, EndpointStatus)>>,
}

impl StatusLog {
    fn transitions(&self) -> Vec<(EndpointStatus, EndpointStatus)> {
        self.transitions.lock().clone()
    }
}

impl EventSink for StatusLog {
    fn on_endpoint_status_changed(&self, _endpoint: &EndpointId, old: EndpointStatus, new: EndpointStatus) {
        self.transitions.lock().push((old, new));
    }
}

struct Harness {
    supervisor: EndpointSupervisor,
    stats: Arc<Statistics>,
    log: Arc<StatusLog>,
    inbound: mpsc::Receiver<(EndpointId, InboundEvent)>,
}

fn harness(config: SupervisorConfig) -> Harness {
    let (tx, rx) = mpsc::channel(64);
    let stats = Arc::new(Statistics::new());
    let log = Arc::new(StatusLog::default());
    let supervisor = EndpointSupervisor::new(config, tx, stats.clone(), log.clone(), CancellationToken::new());
    Harness {
        supervisor,
        stats,
        log,
        inbound: rx,
    }
}

fn add(harness: &Harness, endpoint: MemoryEndpoint) {
    harness
        .supervisor
        .add(Arc::new(endpoint), ChannelConfig::default())
        .unwrap();
}

async fn wait_for_status(supervisor: &EndpointSupervisor, id: &EndpointId, status: EndpointStatus) {
    // Up to two virtual minutes.
    for _ in 0..1200 {
        if supervisor.status(id) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{} never reached {:?}, last {:?}", id, status, supervisor.status(id));
}

async fn wait_for_attempts(handle: &MemoryHandle, attempts: u32) {
    for _ in 0..1200 {
        if handle.connect_attempts() >= attempts {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("only {} connect attempts", handle.connect_attempts());
}

#[tokio::test(start_paused = true)]
async fn test_crash_loop_parks_endpoint_as_failed() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    handle.fail_all_connects();
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Failed).await;

    // Six failures, 10 s apart, all inside the 60 s window.
    assert_eq!(handle.connect_attempts(), 6);
    let record = h.supervisor.record(&id).unwrap();
    assert_eq!(record.consecutive_failures, 6);
    assert!(record.last_failure_at.is_some());
    assert!(record.last_error.unwrap().contains("simulated connect failure"));
    assert!(h.supervisor.connected().is_empty());

    assert_eq!(
        h.log.transitions(),
        vec![
            (EndpointStatus::Connecting, EndpointStatus::Reconnecting),
            (EndpointStatus::Reconnecting, EndpointStatus::Failed),
        ]
    );

    // Parked: no further attempts.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(handle.connect_attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_reset_reconnects_failed_endpoint() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    handle.fail_all_connects();
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Failed).await;

    handle.fail_next_connects(0);
    h.supervisor.reset(&id).await.unwrap();
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;

    let record = h.supervisor.record(&id).unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert!(record.capabilities.is_some());
    assert_eq!(h.supervisor.connected().len(), 1);
    assert_eq!(h.stats.connected_endpoints(), 1);

    let transitions = h.log.transitions();
    assert_eq!(
        &transitions[2..],
        &[
            (EndpointStatus::Failed, EndpointStatus::Connecting),
            (EndpointStatus::Connecting, EndpointStatus::Connected),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_transitions_arrive_in_order() {
    let h = harness(SupervisorConfig {
        max_restarts: 0,
        backoff_min: Duration::ZERO,
        backoff_max: Duration::ZERO,
        ..SupervisorConfig::default()
    });
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    handle.fail_all_connects();
    add(&h, endpoint);
    let id = EndpointId::from("radio1");

    async fn settle(supervisor: &EndpointSupervisor, id: &EndpointId, status: EndpointStatus) {
        for _ in 0..5000 {
            if supervisor.status(id) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("{} never reached {:?}", id, status);
    }

    settle(&h.supervisor, &id, EndpointStatus::Failed).await;
    for _ in 0..50 {
        h.supervisor.reset(&id).await.unwrap();
        settle(&h.supervisor, &id, EndpointStatus::Failed).await;
    }
    handle.fail_next_connects(0);
    h.supervisor.reset(&id).await.unwrap();
    settle(&h.supervisor, &id, EndpointStatus::Connected).await;
    // The sink hears about a change just after the registry records it.
    for _ in 0..5000 {
        if h.log.transitions().len() == 1 + 2 * 50 + 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Each reported transition starts where the previous one ended.
    let transitions = h.log.transitions();
    assert_eq!(transitions.len(), 1 + 2 * 50 + 2);
    assert_eq!(transitions[0], (EndpointStatus::Connecting, EndpointStatus::Failed));
    for pair in transitions.windows(2) {
        assert_eq!(pair[0].1, pair[1].0, "out of order: {:?}", transitions);
    }
    assert_eq!(
        transitions.last(),
        Some(&(EndpointStatus::Connecting, EndpointStatus::Connected))
    );
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_requires_failed_state() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, _handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    assert!(matches!(
        h.supervisor.reset(&id).await,
        Err(RelayError::NotFailed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_within_budget() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    handle.fail_next_connects(3);
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    assert_eq!(handle.connect_attempts(), 4);
    assert_eq!(
        h.log.transitions(),
        vec![
            (EndpointStatus::Connecting, EndpointStatus::Reconnecting),
            (EndpointStatus::Reconnecting, EndpointStatus::Connected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_drop_triggers_reconnect() {
    let config = SupervisorConfig {
        backoff_min: Duration::from_secs(1),
        backoff_max: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness(config);
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;

    handle.drop_link();
    wait_for_attempts(&handle, 2).await;
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;

    let transitions = h.log.transitions();
    assert!(transitions.contains(&(EndpointStatus::Connected, EndpointStatus::Reconnecting)));
    assert!(transitions.contains(&(EndpointStatus::Reconnecting, EndpointStatus::Connected)));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_triggers_reconnect() {
    let config = SupervisorConfig {
        backoff_min: Duration::from_secs(1),
        backoff_max: Duration::from_secs(1),
        heartbeat_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let h = harness(config);
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    wait_for_attempts(&handle, 2).await;
    let record = h.supervisor.record(&EndpointId::from("radio1")).unwrap();
    assert!(record.last_error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_disabled_by_default() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.supervisor.status(&id), Some(EndpointStatus::Connected));
    assert_eq!(handle.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_device_counts_as_failure() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::with_capabilities("radio1", Capabilities::default());
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Failed).await;
    assert_eq!(handle.connect_attempts(), 6);
    assert!(h
        .supervisor
        .record(&id)
        .unwrap()
        .last_error
        .unwrap()
        .contains("unsupported"));
}

#[tokio::test(start_paused = true)]
async fn test_degraded_device_still_connects() {
    let h = harness(SupervisorConfig::default());
    let mut caps = Capabilities::text(8);
    caps.recommendations.push("region not set".to_string());
    let (endpoint, _handle) = MemoryEndpoint::with_capabilities("radio1", caps);
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    let record = h.supervisor.record(&id).unwrap();
    assert_eq!(record.capabilities.unwrap().recommendations.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_events_reach_queue() {
    let mut h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;

    handle.inject_text(99, "!cafe", 1, "hello");
    let (origin, event) = tokio::time::timeout(Duration::from_secs(1), h.inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(origin, id);
    assert_eq!(event.protocol_id, 99);
    assert_eq!(h.supervisor.record(&id).unwrap().received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_remove_disconnects_endpoint() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    assert!(handle.is_connected());

    h.supervisor.remove(&id).await.unwrap();
    assert!(!handle.is_connected());
    assert!(h.supervisor.is_empty());
    assert_eq!(h.stats.connected_endpoints(), 0);

    assert!(matches!(
        h.supervisor.remove(&id).await,
        Err(RelayError::UnknownEndpoint(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_readd_after_remove() {
    let h = harness(SupervisorConfig::default());
    let (endpoint, _handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);

    let id = EndpointId::from("radio1");
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    h.supervisor.remove(&id).await.unwrap();

    let (endpoint, handle) = MemoryEndpoint::new("radio1");
    add(&h, endpoint);
    wait_for_status(&h.supervisor, &id, EndpointStatus::Connected).await;
    assert!(handle.is_connected());
    assert_eq!(h.supervisor.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_all() {
    let h = harness(SupervisorConfig::default());
    let mut handles = Vec::new();
    for name in ["radio1", "radio2", "radio3"] {
        let (endpoint, handle) = MemoryEndpoint::new(name);
        add(&h, endpoint);
        handles.push(handle);
    }
    for name in ["radio1", "radio2", "radio3"] {
        wait_for_status(&h.supervisor, &EndpointId::from(name), EndpointStatus::Connected).await;
    }
    assert_eq!(h.stats.connected_endpoints(), 3);

    h.supervisor.shutdown().await;
    assert!(handles.iter().all(|handle| !handle.is_connected()));

    let (late, _handle) = MemoryEndpoint::new("radio4");
    assert!(matches!(
        h.supervisor.add(Arc::new(late), ChannelConfig::default()),
        Err(RelayError::Stopped)
    ));
}
