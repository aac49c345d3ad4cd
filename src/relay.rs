//! High-level API for running the relay engine.
//!
//! [`Relay`] wires the pieces together: it owns the endpoint supervisor, the
//! dispatcher task that drives the [`Router`], the statistics reporter and
//! the event bus, and exposes the control and query surface.
//!
//! # Example
//!
//! ```no_run
//! use meshrelay::endpoints::memory::MemoryEndpoint;
//! use meshrelay::Relay;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), meshrelay::error::RelayError> {
//! let relay = Relay::from_str("[router.topology]\ntype = \"broadcast\"").await?;
//!
//! let (radio1, mesh1) = MemoryEndpoint::new("radio1");
//! let (radio2, _mesh2) = MemoryEndpoint::new("radio2");
//! relay.add_endpoint(Arc::new(radio1))?;
//! relay.add_endpoint(Arc::new(radio2))?;
//!
//! mesh1.inject_text(1, "!a1b2c3d4", 0, "hello mesh");
//! // ... later
//! println!("{:?}", relay.stats());
//! relay.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigProvider, RelayConfig};
use crate::endpoint::{ChannelConfig, Endpoint};
use crate::error::{RelayError, Result, RuleError};
use crate::events::{EventBus, EventSink, FanoutSink, NullSink, RelayEvent};
use crate::filter::FilterRule;
use crate::message::{EndpointId, InboundEvent};
use crate::router::{Router, RoutingPolicy, SharedPolicy};
use crate::stats::{Statistics, StatsHistory, StatsSnapshot};
use crate::supervisor::{EndpointRecord, EndpointSupervisor};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// Direct sends waiting for the dispatcher.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// A send to one named endpoint, executed by the dispatcher.
struct DirectSend {
    target: EndpointId,
    event: InboundEvent,
    reply: oneshot::Sender<Result<u8>>,
}

/// A handle to a running relay.
///
/// Endpoints are added at runtime with [`Relay::add_endpoint`]. Call
/// [`Relay::stop`] to shut down: every endpoint gets the configured grace
/// period to disconnect before its task is aborted.
pub struct Relay {
    cancel_token: CancellationToken,
    supervisor: EndpointSupervisor,
    policy: SharedPolicy,
    stats: Arc<Statistics>,
    bus: Arc<EventBus>,
    config: RwLock<RelayConfig>,
    commands: mpsc::Sender<DirectSend>,
    handles: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Starts the dispatcher and background tasks for `config`.
    pub async fn start(config: RelayConfig) -> Result<Self> {
        Self::start_with_sink(config, Arc::new(NullSink)).await
    }

    /// Like [`Relay::start`], additionally reporting every event to `sink`.
    pub async fn start_with_sink(config: RelayConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;

        let cancel_token = CancellationToken::new();
        let stats = Arc::new(Statistics::new());
        let bus = Arc::new(EventBus::new(config.general.event_bus_capacity));
        let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(vec![bus.clone() as Arc<dyn EventSink>, sink]));

        let (inbound_tx, inbound_rx) = mpsc::channel(config.general.queue_capacity);
        let supervisor = EndpointSupervisor::new(
            config.supervisor_config(),
            inbound_tx,
            stats.clone(),
            sink.clone(),
            cancel_token.child_token(),
        );

        let policy: SharedPolicy = Arc::new(RwLock::new(Arc::new(config.routing_policy())));
        let router = Router::new(policy.clone(), supervisor.clone(), stats.clone(), sink);

        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_dispatcher(
            router,
            inbound_rx,
            commands_rx,
            config.sweep_interval(),
            cancel_token.child_token(),
        )));

        let log_interval = config.general.stats_log_interval_secs;
        if log_interval > 0 {
            handles.push(tokio::spawn(run_stats_reporter(
                stats.clone(),
                Duration::from_secs(log_interval),
                config.general.stats_history_secs,
                cancel_token.child_token(),
            )));
        }

        info!(
            "Relay started: {} filter rule(s), topology {:?}",
            policy.read().filter.active_rules(),
            config.router.topology
        );

        Ok(Self {
            cancel_token,
            supervisor,
            policy,
            stats,
            bus,
            config: RwLock::new(config),
            commands,
            handles,
        })
    }

    /// Starts a relay from a TOML configuration string.
    #[allow(clippy::should_implement_trait)]
    pub async fn from_str(toml: &str) -> Result<Self> {
        let config = RelayConfig::parse(toml)?;
        Self::start(config).await
    }

    /// Starts a relay by loading configuration from a file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = RelayConfig::load(path).await?;
        Self::start(config).await
    }

    pub async fn from_provider(provider: &dyn ConfigProvider) -> Result<Self> {
        let config = provider.load().await?;
        Self::start(config).await
    }

    /// Registers `endpoint`, with the channel settings configured for its id.
    pub fn add_endpoint(&self, endpoint: Arc<dyn Endpoint>) -> Result<()> {
        let channel_config = self.config.read().channel_config(endpoint.id());
        self.supervisor.add(endpoint, channel_config)
    }

    pub fn add_endpoint_with(&self, endpoint: Arc<dyn Endpoint>, channel_config: ChannelConfig) -> Result<()> {
        self.supervisor.add(endpoint, channel_config)
    }

    pub async fn remove_endpoint(&self, id: &EndpointId) -> Result<()> {
        self.supervisor.remove(id).await
    }

    /// Brings a `Failed` endpoint back under supervision.
    pub async fn reset_endpoint(&self, id: &EndpointId) -> Result<()> {
        self.supervisor.reset(id).await
    }

    /// Reloads configuration from `provider` and swaps in the new routing
    /// policy in one step. Messages already being dispatched finish under the
    /// old policy. Supervisor parameters apply to endpoints added or reset
    /// afterwards.
    pub async fn reload(&self, provider: &dyn ConfigProvider) -> Result<()> {
        if !self.is_running() {
            return Err(RelayError::Stopped);
        }
        let config = provider.load().await?;
        let policy = config.routing_policy();
        let errors = policy.filter.config_errors().len();

        info!(
            "Reloading configuration: {} filter rule(s) ({} invalid), topology {:?}",
            policy.filter.active_rules(),
            errors,
            config.router.topology
        );

        *self.policy.write() = Arc::new(policy);
        self.supervisor.set_config(config.supervisor_config());
        *self.config.write() = config;
        Ok(())
    }

    /// Adds a filter rule to the running policy.
    pub fn add_filter_rule(&self, rule: FilterRule) {
        let mut policy = self.policy.write();
        let updated = policy.with_filter(policy.filter.with_rule(rule));
        *policy = Arc::new(updated);
    }

    /// Removes the filter rule called `name`. Returns whether it existed.
    pub fn remove_filter_rule(&self, name: &str) -> bool {
        let mut policy = self.policy.write();
        let remaining = policy.filter.without_rule(name);
        match remaining {
            Some(filter) => {
                let updated = policy.with_filter(filter);
                *policy = Arc::new(updated);
                true
            }
            None => false,
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointRecord> {
        self.supervisor.records()
    }

    pub fn endpoint(&self, id: &EndpointId) -> Option<EndpointRecord> {
        self.supervisor.record(id)
    }

    /// Number of fingerprints held by the dedup tracker, as of the last
    /// dispatched message or sweep.
    pub fn tracked_fingerprints(&self) -> usize {
        self.stats.tracked_fingerprints()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Filter rules that failed to compile under the current policy.
    pub fn filter_errors(&self) -> Vec<RuleError> {
        self.policy.read().filter.config_errors().to_vec()
    }

    /// The routing policy currently in force.
    pub fn policy(&self) -> Arc<RoutingPolicy> {
        self.policy.read().clone()
    }

    pub fn config(&self) -> RelayConfig {
        self.config.read().clone()
    }

    /// Subscribes to relay events. Slow subscribers lose the oldest events.
    pub fn subscribe(&self) -> async_broadcast::Receiver<RelayEvent> {
        self.bus.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Returns `false` once [`Relay::stop`] has been called or the
    /// cancellation token was triggered.
    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }

    /// Transmit `event` through `target` only, outside the normal fan-out.
    ///
    /// Filter and topology do not apply. The event's channel goes through the
    /// endpoint's channel map and the send is bounded by the router's send
    /// timeout. The fingerprint is tracked, so the mesh's echo of the message
    /// arriving on another endpoint is dropped as a duplicate.
    ///
    /// Returns the channel the endpoint transmitted on.
    pub async fn send(&self, target: &EndpointId, event: InboundEvent) -> Result<u8> {
        if !self.is_running() {
            return Err(RelayError::Stopped);
        }
        let (reply, response) = oneshot::channel();
        let command = DirectSend {
            target: target.clone(),
            event,
            reply,
        };
        self.commands.send(command).await.map_err(|_| RelayError::Stopped)?;
        response.await.map_err(|_| RelayError::Stopped)?
    }

    /// Gracefully stops endpoints and background tasks.
    pub async fn stop(self) {
        info!("Relay stopping...");
        self.supervisor.shutdown().await;
        self.cancel_token.cancel();

        let grace = self.config.read().supervisor_config().shutdown_grace;
        for mut handle in self.handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Background task did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }

        info!("Relay stopped");
    }
}

async fn run_dispatcher(
    mut router: Router,
    mut inbound: mpsc::Receiver<(EndpointId, InboundEvent)>,
    mut commands: mpsc::Receiver<DirectSend>,
    sweep_interval: Duration,
    token: CancellationToken,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Dispatcher shutting down.");
                break;
            }
            _ = sweep.tick() => {
                let removed = router.sweep(Instant::now());
                if removed > 0 {
                    trace!(removed, remaining = router.tracker().len(), "Swept expired fingerprints");
                }
            }
            Some(command) = commands.recv() => {
                let result = router.send_event(&command.target, command.event).await;
                // The caller may have given up waiting.
                let _ = command.reply.send(result);
            }
            next = inbound.recv() => match next {
                Some((origin, event)) => {
                    router.handle_event(origin, event).await;
                }
                None => break,
            }
        }
    }
}

async fn run_stats_reporter(
    stats: Arc<Statistics>,
    log_interval: Duration,
    retention_secs: u64,
    token: CancellationToken,
) {
    let mut history = StatsHistory::new(retention_secs);
    let mut ticker = tokio::time::interval(log_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Stats reporter shutting down.");
                break;
            }
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                history.push(snapshot.clone());

                if let Some(min1) = history.aggregate(60) {
                    info!(
                        "Stats [1min] rx={:.1}/s fwd={:.1}/s dropped={} errors={}",
                        min1.received_per_sec, min1.forwarded_per_sec, min1.dropped, min1.send_errors
                    );
                }
                info!(
                    "Stats [total] rx={} fwd={} dup={} filtered={} errors={} endpoints={} tracked={} max_proc={}us",
                    snapshot.received,
                    snapshot.forwarded,
                    snapshot.dropped_duplicate,
                    snapshot.dropped_filtered,
                    snapshot.send_errors,
                    snapshot.connected_endpoints,
                    snapshot.tracked_fingerprints,
                    snapshot.max_processing_us
                );
            }
        }
    }
}
