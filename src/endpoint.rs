//! The capability every radio link provides to the relay.
//!
//! Transports (serial radios, TCP-attached nodes, test loopbacks) implement
//! [`Endpoint`]. The relay never sees frames or bytes on the wire; it only
//! pulls decoded [`InboundEvent`]s and hands back [`Message`]s to send.

use crate::error::TransportError;
use crate::message::{EndpointId, InboundEvent, Message};
use async_trait::async_trait;
use serde::Deserialize;

/// What a device reported about itself during the connect handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Mesh node id of the attached radio, if known.
    pub node_id: Option<String>,
    pub firmware: Option<String>,
    /// Whether the device can send text packets.
    pub can_send_text: bool,
    /// Number of channels configured on the device.
    pub channel_count: u8,
    /// Operator-facing settings recommendations (e.g. mismatched modem preset).
    pub recommendations: Vec<String>,
}

impl Capabilities {
    /// A text-capable device with `channel_count` channels.
    pub fn text(channel_count: u8) -> Self {
        Self {
            can_send_text: true,
            channel_count,
            ..Default::default()
        }
    }

    /// Verify the device can take part in relaying.
    pub fn check(&self) -> CapabilityCheck {
        if !self.can_send_text {
            return CapabilityCheck::Unsupported("device cannot send text packets".to_string());
        }
        if self.channel_count == 0 {
            return CapabilityCheck::Unsupported("device reports no channels".to_string());
        }
        if self.recommendations.is_empty() {
            CapabilityCheck::Ready
        } else {
            CapabilityCheck::Degraded(self.recommendations.clone())
        }
    }
}

/// Result of the capability check run while an endpoint is Connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityCheck {
    Ready,
    /// Usable, with warnings worth logging.
    Degraded(Vec<String>),
    /// Not usable; treated as a connect failure.
    Unsupported(String),
}

/// Per-endpoint outbound channel remapping.
///
/// Radios on different modem presets may carry the same logical channel at
/// different indexes; `remap` translates the inbound channel index into the
/// index used when sending on this endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub remap: Vec<ChannelRemap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChannelRemap {
    pub from: u8,
    pub to: u8,
}

impl ChannelConfig {
    /// Channel index to use on this endpoint for a message on `channel`.
    pub fn outbound_channel(&self, channel: u8) -> u8 {
        self.remap
            .iter()
            .find(|r| r.from == channel)
            .map(|r| r.to)
            .unwrap_or(channel)
    }
}

/// One radio link.
///
/// Methods take `&self`: `send` is called from the dispatcher's fan-out while
/// the endpoint's own task is blocked in `recv`, so implementations use
/// interior mutability.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &EndpointId;

    /// Open the transport and perform the handshake.
    async fn connect(&self) -> Result<Capabilities, TransportError>;

    /// Close the transport. Must be safe to call when not connected.
    async fn disconnect(&self);

    /// Transmit `message` on `channel` (already remapped for this endpoint).
    async fn send(&self, message: &Message, channel: u8) -> Result<(), TransportError>;

    /// Wait for the next decoded inbound packet.
    async fn recv(&self) -> Result<InboundEvent, TransportError>;
}
