//! In-memory loopback endpoint.
//!
//! Stands in for a radio link in tests and the demo program. The
//! [`MemoryHandle`] returned alongside the endpoint plays the role of the
//! mesh: it injects inbound packets, records what the relay sent, and can
//! inject connect, receive and send failures.

use crate::endpoint::{Capabilities, Endpoint};
use crate::error::TransportError;
use crate::message::{EndpointId, Fingerprint, InboundEvent, Message};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// A message as transmitted by the relay on a memory endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub fingerprint: Fingerprint,
    pub origin_endpoint: EndpointId,
    pub origin_node: String,
    pub channel: u8,
    pub text: Option<String>,
}

enum Inbound {
    Packet(InboundEvent),
    LinkDown,
}

struct Shared {
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    failing_sends: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    capabilities: Mutex<Capabilities>,
    sent: Mutex<Vec<SentMessage>>,
    sent_notify: Notify,
}

/// Loopback [`Endpoint`].
pub struct MemoryEndpoint {
    id: EndpointId,
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

/// Test-side control of a [`MemoryEndpoint`].
#[derive(Clone)]
pub struct MemoryHandle {
    id: EndpointId,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MemoryEndpoint {
    /// Create a text-capable endpoint with 8 channels.
    pub fn new(id: impl Into<String>) -> (Self, MemoryHandle) {
        Self::with_capabilities(id, Capabilities::text(8))
    }

    pub fn with_capabilities(id: impl Into<String>, capabilities: Capabilities) -> (Self, MemoryHandle) {
        let id = EndpointId::new(id);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            failing_connects: AtomicU32::new(0),
            failing_sends: AtomicBool::new(false),
            send_delay: Mutex::new(None),
            capabilities: Mutex::new(capabilities),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
        });
        let endpoint = Self {
            id: id.clone(),
            shared: shared.clone(),
            inbound: tokio::sync::Mutex::new(rx),
        };
        let handle = MemoryHandle {
            id,
            shared,
            inbound: tx,
        };
        (endpoint, handle)
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    async fn connect(&self) -> Result<Capabilities, TransportError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(TransportError::rejected("simulated connect failure"));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        debug!(endpoint = %self.id, "Loopback connected");
        Ok(self.shared.capabilities.lock().clone())
    }

    async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    async fn send(&self, message: &Message, channel: u8) -> Result<(), TransportError> {
        let delay = *self.shared.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if self.shared.failing_sends.load(Ordering::SeqCst) {
            return Err(TransportError::rejected("simulated send failure"));
        }
        self.shared.sent.lock().push(SentMessage {
            fingerprint: message.fingerprint,
            origin_endpoint: message.origin_endpoint.clone(),
            origin_node: message.origin_node.clone(),
            channel,
            text: message.text().map(str::to_string),
        });
        self.shared.sent_notify.notify_waiters();
        Ok(())
    }

    async fn recv(&self) -> Result<InboundEvent, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Inbound::Packet(event)) => Ok(event),
            Some(Inbound::LinkDown) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                Err(TransportError::Disconnected)
            }
            None => Err(TransportError::Disconnected),
        }
    }
}

impl MemoryHandle {
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Deliver a packet to the relay as if heard on the mesh.
    pub fn inject(&self, event: InboundEvent) {
        let _ = self.inbound.send(Inbound::Packet(event));
    }

    pub fn inject_text(&self, protocol_id: u32, origin_node: &str, channel: u8, text: &str) {
        self.inject(InboundEvent::text(protocol_id, origin_node, channel, text));
    }

    /// Make the next `recv` fail as if the link dropped.
    pub fn drop_link(&self) {
        let _ = self.inbound.send(Inbound::LinkDown);
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Fail every connect attempt until cleared with `fail_next_connects(0)`.
    pub fn fail_all_connects(&self) {
        self.shared.failing_connects.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn set_failing_sends(&self, failing: bool) {
        self.shared.failing_sends.store(failing, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.shared.send_delay.lock() = delay;
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.shared.capabilities.lock() = capabilities;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.shared.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.shared.sent.lock().len()
    }

    /// Wait until at least `count` messages were sent or `timeout` elapses.
    /// Returns whether the count was reached.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.sent_notify.notified();
                if self.sent_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
