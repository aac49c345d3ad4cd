//! The dispatch pipeline: dedup, filter, fan-out.
//!
//! [`Router`] is owned by the relay's single dispatcher task. Each inbound
//! message goes through, in order:
//!
//! 1. [`MessageTracker::seen`]: duplicates stop here and never reach the filter.
//! 2. [`FilterChain::evaluate`]: blocked messages stop here.
//! 3. Target selection: the installed [`TargetSelector`] picks among the
//!    connected endpoints, the origin is always removed.
//! 4. Concurrent sends, each bounded by the policy's send timeout. One
//!    target failing never affects the others.
//!
//! [`Router::send_to`] is the one way around this pipeline: a message sent
//! to a single named endpoint skips filter and topology, but its fingerprint
//! is still recorded so the mesh's echo of it is dropped as a duplicate.
//!
//! The routing policy lives behind a shared lock so a config reload can swap
//! it as a whole; the router picks up the new policy on the next message.

use crate::error::{RelayError, TransportError};
use crate::events::{DropReason, EventSink};
use crate::filter::{Decision, FilterChain};
use crate::message::{EndpointId, FingerprintMode, InboundEvent, Message};
use crate::stats::Statistics;
use crate::supervisor::{ConnectedEndpoint, EndpointSupervisor};
use crate::topology::{TargetSelector, Topology};
use crate::tracker::{MessageTracker, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default bound on a single send during fan-out.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the dispatcher consults per message. Replaced wholesale on
/// reload, never mutated in place.
pub struct RoutingPolicy {
    pub filter: FilterChain,
    pub topology: Topology,
    selector: Arc<dyn TargetSelector>,
    pub fingerprint_mode: FingerprintMode,
    pub send_timeout: Duration,
    pub tracker_ttl: Duration,
    pub tracker_max_entries: usize,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::new(FilterChain::allow_all(), Topology::Broadcast)
    }
}

impl RoutingPolicy {
    pub fn new(filter: FilterChain, topology: Topology) -> Self {
        let selector = Arc::from(topology.selector());
        Self {
            filter,
            topology,
            selector,
            fingerprint_mode: FingerprintMode::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            tracker_ttl: DEFAULT_TTL,
            tracker_max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Install a custom target selector in place of the topology's.
    pub fn with_selector(mut self, selector: Box<dyn TargetSelector>) -> Self {
        self.selector = Arc::from(selector);
        self
    }

    /// Copy of this policy with `filter` in place of the current chain.
    pub fn with_filter(&self, filter: FilterChain) -> Self {
        Self {
            filter,
            topology: self.topology.clone(),
            selector: self.selector.clone(),
            fingerprint_mode: self.fingerprint_mode,
            send_timeout: self.send_timeout,
            tracker_ttl: self.tracker_ttl,
            tracker_max_entries: self.tracker_max_entries,
        }
    }

    pub fn with_fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.fingerprint_mode = mode;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_tracker_limits(mut self, ttl: Duration, max_entries: usize) -> Self {
        self.tracker_ttl = ttl;
        self.tracker_max_entries = max_entries.max(1);
        self
    }

    pub fn targets(&self, origin: &EndpointId, connected: &[EndpointId]) -> Vec<EndpointId> {
        self.selector.targets(origin, connected)
    }
}

/// Policy handle shared between the dispatcher and the relay's reload path.
pub type SharedPolicy = Arc<RwLock<Arc<RoutingPolicy>>>;

/// Result of one send during fan-out.
#[derive(Debug)]
pub struct Delivery {
    pub target: EndpointId,
    pub channel: u8,
    pub result: Result<(), TransportError>,
}

/// What happened to a message.
#[derive(Debug)]
pub enum RouteOutcome {
    Duplicate,
    Filtered(Decision),
    /// Admitted, but no endpoint was eligible.
    NoTargets,
    Dispatched(Vec<Delivery>),
}

impl RouteOutcome {
    /// Number of targets the message reached.
    pub fn delivered(&self) -> usize {
        match self {
            RouteOutcome::Dispatched(deliveries) => deliveries.iter().filter(|d| d.result.is_ok()).count(),
            _ => 0,
        }
    }

    pub fn failed(&self) -> usize {
        match self {
            RouteOutcome::Dispatched(deliveries) => deliveries.iter().filter(|d| d.result.is_err()).count(),
            _ => 0,
        }
    }
}

pub struct Router {
    tracker: MessageTracker,
    policy: SharedPolicy,
    supervisor: EndpointSupervisor,
    stats: Arc<Statistics>,
    sink: Arc<dyn EventSink>,
}

impl Router {
    pub fn new(
        policy: SharedPolicy,
        supervisor: EndpointSupervisor,
        stats: Arc<Statistics>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (ttl, max_entries) = {
            let policy = policy.read();
            (policy.tracker_ttl, policy.tracker_max_entries)
        };
        Self {
            tracker: MessageTracker::new(ttl, max_entries),
            policy,
            supervisor,
            stats,
            sink,
        }
    }

    pub fn tracker(&self) -> &MessageTracker {
        &self.tracker
    }

    /// Drop expired fingerprints and refresh the gauge.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let removed = self.tracker.sweep(now);
        self.stats.set_tracked_fingerprints(self.tracker.len());
        removed
    }

    /// Build a [`Message`] from a raw inbound event and route it.
    pub async fn handle_event(&mut self, origin: EndpointId, event: InboundEvent) -> RouteOutcome {
        let mode = self.policy.read().fingerprint_mode;
        let message = Arc::new(Message::from_event(origin, event, mode));
        self.handle(message).await
    }

    /// Route one message.
    pub async fn handle(&mut self, message: Arc<Message>) -> RouteOutcome {
        let started = Instant::now();
        self.stats.on_received();

        let policy = self.policy.read().clone();
        self.apply_tracker_limits(&policy);

        let outcome = self.route(&policy, message).await;

        self.stats.set_tracked_fingerprints(self.tracker.len());
        self.stats.record_processing_time(started.elapsed());
        outcome
    }

    /// Send a raw event through `target` alone, attributed to that endpoint.
    pub async fn send_event(&mut self, target: &EndpointId, event: InboundEvent) -> crate::error::Result<u8> {
        let mode = self.policy.read().fingerprint_mode;
        let message = Arc::new(Message::from_event(target.clone(), event, mode));
        self.send_to(target, message).await
    }

    /// Send `message` to one connected endpoint, bypassing filter and
    /// topology. Returns the channel used after the endpoint's remap.
    pub async fn send_to(&mut self, target: &EndpointId, message: Arc<Message>) -> crate::error::Result<u8> {
        let policy = self.policy.read().clone();
        self.apply_tracker_limits(&policy);

        let connected = self.supervisor.connected();
        let Some(endpoint) = connected.iter().find(|c| c.id == *target) else {
            return Err(match self.supervisor.status(target) {
                None => RelayError::unknown_endpoint(target.as_str()),
                Some(_) => RelayError::NotConnected(target.to_string()),
            });
        };

        // Echoes of this message must not be relayed back out.
        self.tracker.seen(message.fingerprint);
        self.stats.set_tracked_fingerprints(self.tracker.len());

        let (channel, result) = send_one(endpoint, &message, policy.send_timeout).await;
        self.record_delivery(&message, endpoint, &result);
        match result {
            Ok(()) => {
                debug!(target = %target, channel, fingerprint = %message.fingerprint, "Direct send");
                Ok(channel)
            }
            Err(source) => Err(RelayError::Send {
                endpoint: target.to_string(),
                source,
            }),
        }
    }

    fn apply_tracker_limits(&mut self, policy: &RoutingPolicy) {
        if self.tracker.ttl() != policy.tracker_ttl || self.tracker.max_entries() != policy.tracker_max_entries {
            debug!(
                ttl = ?policy.tracker_ttl,
                max_entries = policy.tracker_max_entries,
                "Applying new tracker limits"
            );
            self.tracker.reconfigure(policy.tracker_ttl, policy.tracker_max_entries);
        }
    }

    async fn route(&mut self, policy: &RoutingPolicy, message: Arc<Message>) -> RouteOutcome {
        if !self.tracker.seen(message.fingerprint) {
            trace!(
                fingerprint = %message.fingerprint,
                origin = %message.origin_endpoint,
                "Duplicate dropped"
            );
            self.drop_message(&message, DropReason::Duplicate);
            return RouteOutcome::Duplicate;
        }

        let decision = policy.filter.evaluate(&message);
        if decision.is_blocked() {
            debug!(
                fingerprint = %message.fingerprint,
                rule = ?decision.matched_rule,
                "Message blocked by filter"
            );
            self.drop_message(
                &message,
                DropReason::Filtered {
                    rule: decision.matched_rule.clone(),
                    kind: decision.matched_kind,
                },
            );
            return RouteOutcome::Filtered(decision);
        }

        let connected = self.supervisor.connected();
        let targets = select_targets(policy, &message.origin_endpoint, &connected);
        if targets.is_empty() {
            trace!(fingerprint = %message.fingerprint, "No eligible targets");
            return RouteOutcome::NoTargets;
        }

        let timeout = policy.send_timeout;
        let sends = targets.iter().map(|target| {
            let message = &message;
            async move {
                let (channel, result) = send_one(target, message, timeout).await;
                (*target, channel, result)
            }
        });
        let results = join_all(sends).await;

        let mut deliveries = Vec::with_capacity(results.len());
        for (target, channel, result) in results {
            self.record_delivery(&message, target, &result);
            deliveries.push(Delivery {
                target: target.id.clone(),
                channel,
                result,
            });
        }
        RouteOutcome::Dispatched(deliveries)
    }

    fn record_delivery(&self, message: &Arc<Message>, target: &ConnectedEndpoint, result: &Result<(), TransportError>) {
        match result {
            Ok(()) => {
                target.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.stats.on_forwarded();
                self.sink.on_forwarded(message, &target.id);
            }
            Err(e) => {
                target.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.stats.on_send_error();
                warn!(
                    target = %target.id,
                    fingerprint = %message.fingerprint,
                    "Send failed: {}",
                    e
                );
                self.sink.on_send_error(message, &target.id, e);
            }
        }
    }

    fn drop_message(&self, message: &Arc<Message>, reason: DropReason) {
        self.stats.on_dropped(&reason);
        self.sink.on_dropped(message, &reason);
    }
}

/// One bounded send on the endpoint's remapped channel.
async fn send_one(
    target: &ConnectedEndpoint,
    message: &Message,
    timeout: Duration,
) -> (u8, Result<(), TransportError>) {
    let channel = target.channel_config.outbound_channel(message.channel);
    let result = tokio::time::timeout(timeout, target.endpoint.send(message, channel))
        .await
        .unwrap_or(Err(TransportError::Timeout(timeout)));
    (channel, result)
}

/// Connected endpoints the policy selects for `origin`, never the origin
/// itself.
fn select_targets<'a>(
    policy: &RoutingPolicy,
    origin: &EndpointId,
    connected: &'a [ConnectedEndpoint],
) -> Vec<&'a ConnectedEndpoint> {
    let ids: Vec<EndpointId> = connected.iter().map(|c| c.id.clone()).collect();
    let selected = policy.targets(origin, &ids);
    connected
        .iter()
        .filter(|c| c.id != *origin && selected.contains(&c.id))
        .collect()
}
