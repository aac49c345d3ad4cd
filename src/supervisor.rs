//! Endpoint lifecycle supervision.
//!
//! Every registered endpoint gets one task that owns its lifecycle:
//!
//! ```text
//! Connecting -> Connected -> Reconnecting -> Connected
//!                                       \-> Failed
//! ```
//!
//! The task connects, checks capabilities, then pumps inbound events into the
//! shared dispatcher queue until the transport fails or the heartbeat times
//! out. Failures are charged against a [`RestartBudget`]; an endpoint that
//! exhausts it is parked as `Failed` and excluded from fan-out until
//! [`EndpointSupervisor::reset`] is called.
//!
//! Only the endpoint's own task writes its status. Readers take snapshots
//! through the registry lock.

use crate::endpoint::{Capabilities, CapabilityCheck, ChannelConfig, Endpoint};
use crate::error::{RelayError, Result, TransportError};
use crate::events::EventSink;
use crate::message::{EndpointId, InboundEvent};
use crate::stats::Statistics;
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Deadline stand-in for grace periods that overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Exponential backoff helper for connection retries.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` instance.
    ///
    /// # Arguments
    ///
    /// * `min` - The initial delay.
    /// * `max` - Upper bound for the delay.
    /// * `multiplier` - Growth factor applied after each call to `next_backoff()`.
    ///   `1.0` gives a fixed delay of `min`.
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
            multiplier: multiplier.max(1.0),
        }
    }

    /// Returns the delay to wait now and advances the state for the next call.
    pub fn next_backoff(&mut self) -> Duration {
        let wait = self.current;
        let grown = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(self.max, grown);
        wait
    }

    /// Back to the minimum delay; called after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Sliding-window failure budget.
///
/// Allows `max_restarts` failures within `window`; the next one exhausts it.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            failures: VecDeque::new(),
        }
    }

    /// Charge a failure at `now`. Returns `false` once more than
    /// `max_restarts` failures fall within the window.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len() <= self.max_restarts as usize
    }

    pub fn failures_in_window(&self) -> usize {
        self.failures.len()
    }
}

/// Supervision parameters. Applied to an endpoint when it is added or reset.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    pub connect_timeout: Duration,
    /// Treat the link as dead when nothing arrives for this long.
    pub heartbeat_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window: Duration::from_secs(60),
            backoff_min: Duration::from_secs(10),
            backoff_max: Duration::from_secs(10),
            backoff_multiplier: 1.0,
            connect_timeout: Duration::from_secs(30),
            heartbeat_timeout: None,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointStatus {
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointStatus::Connecting => "connecting",
            EndpointStatus::Connected => "connected",
            EndpointStatus::Reconnecting => "reconnecting",
            EndpointStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-endpoint traffic counters.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    pub received: AtomicU64,
    pub sent: AtomicU64,
    pub errors: AtomicU64,
}

/// Point-in-time view of one registered endpoint.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub status: EndpointStatus,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub last_error: Option<String>,
    pub channel_config: ChannelConfig,
    /// Reported at the last successful connect.
    pub capabilities: Option<Capabilities>,
    pub received: u64,
    pub sent: u64,
    pub errors: u64,
}

/// A connected endpoint eligible as a fan-out target.
#[derive(Clone)]
pub struct ConnectedEndpoint {
    pub id: EndpointId,
    pub endpoint: Arc<dyn Endpoint>,
    pub channel_config: ChannelConfig,
    pub counters: Arc<EndpointCounters>,
}

struct Slot {
    endpoint: Arc<dyn Endpoint>,
    channel_config: ChannelConfig,
    status: EndpointStatus,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_error: Option<String>,
    capabilities: Option<Capabilities>,
    counters: Arc<EndpointCounters>,
    // Distinguishes a re-added id from a task that is still winding down.
    generation: u64,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn record(&self, id: &EndpointId) -> EndpointRecord {
        EndpointRecord {
            id: id.clone(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            last_error: self.last_error.clone(),
            channel_config: self.channel_config.clone(),
            capabilities: self.capabilities.clone(),
            received: self.counters.received.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    registry: RwLock<AHashMap<EndpointId, Slot>>,
    config: RwLock<SupervisorConfig>,
    inbound_tx: mpsc::Sender<(EndpointId, InboundEvent)>,
    stats: Arc<Statistics>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    next_generation: AtomicU64,
}

impl Inner {
    /// Apply `update` to the slot owned by (`id`, `generation`) and report
    /// the status transition, if any.
    fn update(&self, id: &EndpointId, generation: u64, update: impl FnOnce(&mut Slot)) {
        let transition = {
            let mut registry = self.registry.write();
            let Some(slot) = registry.get_mut(id).filter(|s| s.generation == generation) else {
                return;
            };
            let old = slot.status;
            update(slot);
            let new = slot.status;
            if old != new {
                self.refresh_connected_gauge(&registry);
                Some((old, new))
            } else {
                None
            }
        };
        if let Some((old, new)) = transition {
            debug!(endpoint = %id, "Status {} -> {}", old, new);
            self.sink.on_endpoint_status_changed(id, old, new);
        }
    }

    fn refresh_connected_gauge(&self, registry: &AHashMap<EndpointId, Slot>) {
        let connected = registry
            .values()
            .filter(|s| s.status == EndpointStatus::Connected)
            .count();
        self.stats.set_connected_endpoints(connected);
    }
}

/// Owns the set of registered endpoints and their lifecycle tasks.
#[derive(Clone)]
pub struct EndpointSupervisor {
    inner: Arc<Inner>,
}

impl EndpointSupervisor {
    /// `inbound_tx` is the dispatcher queue; `cancel` is the relay-wide
    /// shutdown token, each endpoint task runs under a child of it.
    pub fn new(
        config: SupervisorConfig,
        inbound_tx: mpsc::Sender<(EndpointId, InboundEvent)>,
        stats: Arc<Statistics>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(AHashMap::new()),
                config: RwLock::new(config),
                inbound_tx,
                stats,
                sink,
                cancel,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> SupervisorConfig {
        self.inner.config.read().clone()
    }

    /// Replace the supervision parameters. Running endpoint tasks keep the
    /// parameters they were started with.
    pub fn set_config(&self, config: SupervisorConfig) {
        *self.inner.config.write() = config;
    }

    /// Register `endpoint` and start supervising it. Must be called from
    /// within a tokio runtime.
    pub fn add(&self, endpoint: Arc<dyn Endpoint>, channel_config: ChannelConfig) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(RelayError::Stopped);
        }
        let id = endpoint.id().clone();
        let mut registry = self.inner.registry.write();
        if registry.contains_key(&id) {
            return Err(RelayError::DuplicateEndpoint(id.to_string()));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.cancel.child_token();
        let counters = Arc::new(EndpointCounters::default());
        let task = tokio::spawn(run_endpoint(
            self.inner.clone(),
            id.clone(),
            generation,
            endpoint.clone(),
            counters.clone(),
            token.clone(),
        ));
        registry.insert(
            id.clone(),
            Slot {
                endpoint,
                channel_config,
                status: EndpointStatus::Connecting,
                consecutive_failures: 0,
                last_failure_at: None,
                last_error: None,
                capabilities: None,
                counters,
                generation,
                token,
                task: Some(task),
            },
        );
        info!(endpoint = %id, "Endpoint added");
        Ok(())
    }

    /// Stop supervising `id`: cancel its task and wait up to the shutdown
    /// grace period for it to disconnect.
    pub async fn remove(&self, id: &EndpointId) -> Result<()> {
        let slot = {
            let mut registry = self.inner.registry.write();
            let slot = registry
                .remove(id)
                .ok_or_else(|| RelayError::unknown_endpoint(id.as_str()))?;
            self.inner.refresh_connected_gauge(&registry);
            slot
        };
        slot.token.cancel();
        if let Some(mut task) = slot.task {
            let grace = self.inner.config.read().shutdown_grace;
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(endpoint = %id, "Endpoint did not stop within {:?}, aborting", grace);
                task.abort();
            }
        }
        info!(endpoint = %id, "Endpoint removed");
        Ok(())
    }

    /// Restart a `Failed` endpoint with a fresh restart budget.
    pub async fn reset(&self, id: &EndpointId) -> Result<()> {
        let finished = {
            let mut registry = self.inner.registry.write();
            let slot = registry
                .get_mut(id)
                .ok_or_else(|| RelayError::unknown_endpoint(id.as_str()))?;
            if slot.status != EndpointStatus::Failed {
                return Err(RelayError::NotFailed(id.to_string()));
            }
            slot.task.take()
        };
        // A Failed task is already on its way out.
        if let Some(task) = finished {
            let _ = task.await;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry.write();
            let slot = registry
                .get_mut(id)
                .ok_or_else(|| RelayError::unknown_endpoint(id.as_str()))?;
            if slot.status != EndpointStatus::Failed || slot.task.is_some() {
                return Err(RelayError::NotFailed(id.to_string()));
            }
            slot.generation = generation;
            slot.status = EndpointStatus::Connecting;
            slot.token = self.inner.cancel.child_token();
        }
        info!(endpoint = %id, "Endpoint reset");
        // Announce the transition before the new task can report its own.
        self.inner
            .sink
            .on_endpoint_status_changed(id, EndpointStatus::Failed, EndpointStatus::Connecting);

        if let Some(slot) = self.inner.registry.write().get_mut(id) {
            // Removed or reset again in between: nothing left to start.
            if slot.generation == generation && slot.task.is_none() && !self.inner.cancel.is_cancelled() {
                slot.task = Some(tokio::spawn(run_endpoint(
                    self.inner.clone(),
                    id.clone(),
                    generation,
                    slot.endpoint.clone(),
                    slot.counters.clone(),
                    slot.token.clone(),
                )));
            }
        }
        Ok(())
    }

    pub fn status(&self, id: &EndpointId) -> Option<EndpointStatus> {
        self.inner.registry.read().get(id).map(|s| s.status)
    }

    pub fn record(&self, id: &EndpointId) -> Option<EndpointRecord> {
        self.inner.registry.read().get(id).map(|s| s.record(id))
    }

    /// All registered endpoints, ordered by id.
    pub fn records(&self) -> Vec<EndpointRecord> {
        let mut records: Vec<_> = self
            .inner
            .registry
            .read()
            .iter()
            .map(|(id, slot)| slot.record(id))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Endpoints currently `Connected`, ordered by id.
    pub fn connected(&self) -> Vec<ConnectedEndpoint> {
        let mut connected: Vec<_> = self
            .inner
            .registry
            .read()
            .iter()
            .filter(|(_, slot)| slot.status == EndpointStatus::Connected)
            .map(|(id, slot)| ConnectedEndpoint {
                id: id.clone(),
                endpoint: slot.endpoint.clone(),
                channel_config: slot.channel_config.clone(),
                counters: slot.counters.clone(),
            })
            .collect();
        connected.sort_by(|a, b| a.id.cmp(&b.id));
        connected
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.read().is_empty()
    }

    /// Cancel every endpoint task and wait up to the shutdown grace period
    /// for them to disconnect; stragglers are aborted.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let grace = self.inner.config.read().shutdown_grace;
        let mut tasks: Vec<(EndpointId, JoinHandle<()>)> = self
            .inner
            .registry
            .write()
            .iter_mut()
            .filter_map(|(id, slot)| slot.task.take().map(|task| (id.clone(), task)))
            .collect();

        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(grace).unwrap_or_else(|| now + FAR_FUTURE);
        for (id, task) in tasks.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                warn!(endpoint = %id, "Endpoint did not stop within grace period, aborting");
                task.abort();
            }
        }
    }
}

enum ConnectOutcome {
    Connected(Capabilities),
    Failed(TransportError),
    Cancelled,
}

async fn connect(
    id: &EndpointId,
    endpoint: &dyn Endpoint,
    connect_timeout: Duration,
    token: &CancellationToken,
) -> ConnectOutcome {
    let result = tokio::select! {
        _ = token.cancelled() => return ConnectOutcome::Cancelled,
        r = tokio::time::timeout(connect_timeout, endpoint.connect()) => r,
    };
    let capabilities = match result {
        Ok(Ok(capabilities)) => capabilities,
        Ok(Err(e)) => return ConnectOutcome::Failed(e),
        Err(_) => return ConnectOutcome::Failed(TransportError::Timeout(connect_timeout)),
    };

    match capabilities.check() {
        CapabilityCheck::Ready => ConnectOutcome::Connected(capabilities),
        CapabilityCheck::Degraded(warnings) => {
            for warning in &warnings {
                warn!(endpoint = %id, "Device settings: {}", warning);
            }
            ConnectOutcome::Connected(capabilities)
        }
        CapabilityCheck::Unsupported(reason) => {
            ConnectOutcome::Failed(TransportError::Unsupported(reason))
        }
    }
}

/// Pump inbound events into the dispatcher queue. Returns the error that
/// ended the session, or `None` when cancelled.
async fn pump(
    inner: &Inner,
    id: &EndpointId,
    endpoint: &dyn Endpoint,
    counters: &EndpointCounters,
    heartbeat_timeout: Option<Duration>,
    token: &CancellationToken,
) -> Option<TransportError> {
    loop {
        let next = async {
            match heartbeat_timeout {
                Some(limit) => tokio::time::timeout(limit, endpoint.recv())
                    .await
                    .unwrap_or(Err(TransportError::Timeout(limit))),
                None => endpoint.recv().await,
            }
        };
        let event = tokio::select! {
            _ = token.cancelled() => return None,
            r = next => match r {
                Ok(event) => event,
                Err(e) => return Some(e),
            },
        };
        counters.received.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            _ = token.cancelled() => return None,
            r = inner.inbound_tx.send((id.clone(), event)) => {
                if r.is_err() {
                    debug!(endpoint = %id, "Inbound queue closed");
                    return None;
                }
            }
        }
    }
}

async fn run_endpoint(
    inner: Arc<Inner>,
    id: EndpointId,
    generation: u64,
    endpoint: Arc<dyn Endpoint>,
    counters: Arc<EndpointCounters>,
    token: CancellationToken,
) {
    let config = inner.config.read().clone();
    let mut backoff = ExponentialBackoff::new(
        config.backoff_min,
        config.backoff_max,
        config.backoff_multiplier,
    );
    let mut budget = RestartBudget::new(config.max_restarts, config.restart_window);

    loop {
        let failure = match connect(&id, endpoint.as_ref(), config.connect_timeout, &token).await {
            ConnectOutcome::Cancelled => break,
            ConnectOutcome::Failed(e) => e,
            ConnectOutcome::Connected(capabilities) => {
                backoff.reset();
                info!(endpoint = %id, node = ?capabilities.node_id, "Endpoint connected");
                inner.update(&id, generation, |slot| {
                    slot.status = EndpointStatus::Connected;
                    slot.consecutive_failures = 0;
                    slot.capabilities = Some(capabilities);
                });
                match pump(
                    &inner,
                    &id,
                    endpoint.as_ref(),
                    &counters,
                    config.heartbeat_timeout,
                    &token,
                )
                .await
                {
                    Some(e) => e,
                    None => break,
                }
            }
        };

        endpoint.disconnect().await;
        // Read through the tokio clock, which may be paused.
        let now = tokio::time::Instant::now().into_std();
        let within_budget = budget.record_failure(now);
        let message = failure.to_string();
        inner.update(&id, generation, |slot| {
            slot.status = if within_budget {
                EndpointStatus::Reconnecting
            } else {
                EndpointStatus::Failed
            };
            slot.consecutive_failures += 1;
            slot.last_failure_at = Some(now);
            slot.last_error = Some(message);
        });

        if !within_budget {
            error!(
                endpoint = %id,
                "Endpoint failed {} times within {:?}, giving up: {}",
                budget.failures_in_window(),
                config.restart_window,
                failure
            );
            return;
        }

        let wait = backoff.next_backoff();
        warn!(endpoint = %id, "Endpoint error: {}. Reconnecting in {:.1?}", failure, wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = token.cancelled() => break,
        }
    }

    endpoint.disconnect().await;
    debug!(endpoint = %id, "Supervisor task stopped");
}
