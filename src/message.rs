//! Message records flowing through the relay.
//!
//! An endpoint decodes link-layer frames into [`InboundEvent`]s. The
//! dispatcher turns each event into an immutable [`Message`] tagged with the
//! endpoint it arrived on and a [`Fingerprint`] used for loop prevention.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::time::Instant;

/// Unique identifier for a relay endpoint (one radio link).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Addressing of a mesh packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Node(String),
}

/// Message body: decoded text, or opaque bytes for non-text ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
}

impl Payload {
    /// Text content, if the payload is textual.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }
}

/// Raw fields handed over by an endpoint for every received packet.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Packet id assigned by the mesh protocol.
    pub protocol_id: u32,
    /// Node that originated the packet on the mesh.
    pub origin_node: String,
    pub destination: Destination,
    pub channel: u8,
    pub payload: Payload,
    pub received_at: Instant,
}

impl InboundEvent {
    /// Broadcast text packet received now.
    pub fn text(protocol_id: u32, origin_node: impl Into<String>, channel: u8, text: impl Into<String>) -> Self {
        Self {
            protocol_id,
            origin_node: origin_node.into(),
            destination: Destination::Broadcast,
            channel,
            payload: Payload::Text(text.into()),
            received_at: Instant::now(),
        }
    }
}

/// Key identifying a message for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Which message fields feed the fingerprint.
///
/// The origin endpoint is never part of it: the same packet heard by two
/// radios must collapse to one fingerprint, or echoes would loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintMode {
    /// Protocol packet id only.
    ProtocolId,
    /// Protocol packet id, origin node and channel.
    #[default]
    IdOriginChannel,
    /// Protocol packet id, origin node, channel and payload bytes.
    IdOriginChannelPayload,
}

// Fixed seeds keep fingerprints stable for the lifetime of the process.
const FINGERPRINT_SEEDS: [u64; 4] = [
    0x6d65_7368_7265_6c61,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
];

impl FingerprintMode {
    /// Derive the fingerprint of an inbound event.
    pub fn fingerprint(self, event: &InboundEvent) -> Fingerprint {
        let [k0, k1, k2, k3] = FINGERPRINT_SEEDS;
        let mut hasher = ahash::RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
        event.protocol_id.hash(&mut hasher);
        match self {
            FingerprintMode::ProtocolId => {}
            FingerprintMode::IdOriginChannel => {
                event.origin_node.hash(&mut hasher);
                event.channel.hash(&mut hasher);
            }
            FingerprintMode::IdOriginChannelPayload => {
                event.origin_node.hash(&mut hasher);
                event.channel.hash(&mut hasher);
                event.payload.as_bytes().hash(&mut hasher);
            }
        }
        Fingerprint(hasher.finish())
    }
}

/// A message admitted into the dispatch pipeline. Never mutated.
#[derive(Debug, Clone)]
pub struct Message {
    pub fingerprint: Fingerprint,
    /// Endpoint the message arrived on; never a delivery target.
    pub origin_endpoint: EndpointId,
    pub protocol_id: u32,
    pub origin_node: String,
    pub destination: Destination,
    pub channel: u8,
    pub payload: Payload,
    pub received_at: Instant,
}

impl Message {
    pub fn from_event(origin_endpoint: EndpointId, event: InboundEvent, mode: FingerprintMode) -> Self {
        let fingerprint = mode.fingerprint(&event);
        Self {
            fingerprint,
            origin_endpoint,
            protocol_id: event.protocol_id,
            origin_node: event.origin_node,
            destination: event.destination,
            channel: event.channel,
            payload: event.payload,
            received_at: event.received_at,
        }
    }

    /// Payload text, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_origin_endpoint() {
        let event = InboundEvent::text(42, "!a1b2c3d4", 0, "hello");
        let a = Message::from_event(EndpointId::from("radio1"), event.clone(), FingerprintMode::default());
        let b = Message::from_event(EndpointId::from("radio2"), event, FingerprintMode::default());
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_fingerprint_modes() {
        let base = InboundEvent::text(42, "!a1b2c3d4", 0, "hello");
        let other_channel = InboundEvent::text(42, "!a1b2c3d4", 1, "hello");
        let other_text = InboundEvent::text(42, "!a1b2c3d4", 0, "bye");

        let id_only = FingerprintMode::ProtocolId;
        assert_eq!(id_only.fingerprint(&base), id_only.fingerprint(&other_channel));

        let default = FingerprintMode::IdOriginChannel;
        assert_ne!(default.fingerprint(&base), default.fingerprint(&other_channel));
        assert_eq!(default.fingerprint(&base), default.fingerprint(&other_text));

        let with_payload = FingerprintMode::IdOriginChannelPayload;
        assert_ne!(with_payload.fingerprint(&base), with_payload.fingerprint(&other_text));
    }

    #[test]
    fn test_payload_text() {
        assert_eq!(Payload::Text("hi".into()).as_text(), Some("hi"));
        assert_eq!(Payload::Bytes(Bytes::from_static(b"\x01\x02")).as_text(), None);
    }
}
