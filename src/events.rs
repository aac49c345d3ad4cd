//! Observer contract for collaborators outside the core.
//!
//! Persistence, metrics exporters and broker bridges implement [`EventSink`]
//! (every method defaults to a no-op). [`EventBus`] is a ready-made sink that
//! republishes everything as [`RelayEvent`]s on a broadcast channel so any
//! number of async consumers can subscribe.

use crate::error::TransportError;
use crate::filter::RuleKindTag;
use crate::message::{EndpointId, Message};
use crate::supervisor::EndpointStatus;
use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use std::sync::Arc;
use tracing::warn;

/// Why a message was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Fingerprint already seen within its TTL.
    Duplicate,
    /// Blocked by the filter chain; `rule` is `None` when the default action blocked.
    Filtered {
        rule: Option<String>,
        kind: Option<RuleKindTag>,
    },
}

/// Receives relay events. Called synchronously from the dispatcher and
/// supervisor tasks, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_forwarded(&self, _message: &Arc<Message>, _target: &EndpointId) {}

    fn on_dropped(&self, _message: &Arc<Message>, _reason: &DropReason) {}

    fn on_send_error(&self, _message: &Arc<Message>, _target: &EndpointId, _error: &TransportError) {}

    fn on_endpoint_status_changed(&self, _endpoint: &EndpointId, _old: EndpointStatus, _new: EndpointStatus) {}
}

/// Sink that ignores everything.
pub struct NullSink;

impl EventSink for NullSink {}

/// Forwards each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn on_forwarded(&self, message: &Arc<Message>, target: &EndpointId) {
        for sink in &self.sinks {
            sink.on_forwarded(message, target);
        }
    }

    fn on_dropped(&self, message: &Arc<Message>, reason: &DropReason) {
        for sink in &self.sinks {
            sink.on_dropped(message, reason);
        }
    }

    fn on_send_error(&self, message: &Arc<Message>, target: &EndpointId, error: &TransportError) {
        for sink in &self.sinks {
            sink.on_send_error(message, target, error);
        }
    }

    fn on_endpoint_status_changed(&self, endpoint: &EndpointId, old: EndpointStatus, new: EndpointStatus) {
        for sink in &self.sinks {
            sink.on_endpoint_status_changed(endpoint, old, new);
        }
    }
}

/// Event as published on the [`EventBus`].
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Forwarded {
        message: Arc<Message>,
        target: EndpointId,
    },
    Dropped {
        message: Arc<Message>,
        reason: DropReason,
    },
    SendError {
        message: Arc<Message>,
        target: EndpointId,
        error: String,
    },
    StatusChanged {
        endpoint: EndpointId,
        old: EndpointStatus,
        new: EndpointStatus,
    },
}

/// Broadcast channel of [`RelayEvent`]s.
///
/// Slow subscribers lose the oldest events rather than stalling the relay;
/// they observe this as `RecvError::Overflowed`.
pub struct EventBus {
    tx: Sender<RelayEvent>,
    // Keeps the channel open while nobody is subscribed.
    _inactive: InactiveReceiver<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            _inactive: rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> Receiver<RelayEvent> {
        self.tx.new_receiver()
    }

    fn publish(&self, event: RelayEvent) {
        match self.tx.try_broadcast(event) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {}
            Err(TrySendError::Full(_)) => warn!("Event bus full, event dropped"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl EventSink for EventBus {
    fn on_forwarded(&self, message: &Arc<Message>, target: &EndpointId) {
        self.publish(RelayEvent::Forwarded {
            message: message.clone(),
            target: target.clone(),
        });
    }

    fn on_dropped(&self, message: &Arc<Message>, reason: &DropReason) {
        self.publish(RelayEvent::Dropped {
            message: message.clone(),
            reason: reason.clone(),
        });
    }

    fn on_send_error(&self, message: &Arc<Message>, target: &EndpointId, error: &TransportError) {
        self.publish(RelayEvent::SendError {
            message: message.clone(),
            target: target.clone(),
            error: error.to_string(),
        });
    }

    fn on_endpoint_status_changed(&self, endpoint: &EndpointId, old: EndpointStatus, new: EndpointStatus) {
        self.publish(RelayEvent::StatusChanged {
            endpoint: endpoint.clone(),
            old,
            new,
        });
    }
}
