//! Error types for meshrelay.
//!
//! Two layers of errors exist. [`TransportError`] is what an endpoint's
//! transport reports; the supervisor recovers from it locally, and a direct
//! send hands it back wrapped in [`RelayError::Send`]. [`RelayError`] covers API misuse and configuration
//! problems surfaced to whoever drives the [`Relay`](crate::relay::Relay).

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an endpoint transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying I/O failure (serial port, socket).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The link went away (EOF, device unplugged, peer closed).
    #[error("transport disconnected")]
    Disconnected,

    /// An operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The device refused the request.
    #[error("rejected by device: {0}")]
    Rejected(String),

    /// The device cannot participate in the relay.
    #[error("unsupported device: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Create a new rejection error
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Create a new unsupported-device error
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported(reason.into())
    }
}

/// A filter rule that could not be compiled.
///
/// Rules with errors are skipped; the rest of the chain stays active.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid filter rule '{rule}': {reason}")]
pub struct RuleError {
    /// Name of the offending rule
    pub rule: String,
    /// Why it could not be compiled
    pub reason: String,
}

/// Main error type for relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// An endpoint id that the supervisor does not know
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// An endpoint id that is already registered
    #[error("Endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    /// `reset` called on an endpoint that is not in the Failed state
    #[error("Endpoint '{0}' is not failed")]
    NotFailed(String),

    /// A direct send to an endpoint that has no live link
    #[error("Endpoint '{0}' is not connected")]
    NotConnected(String),

    /// A direct send that the endpoint's transport did not complete
    #[error("Send via '{endpoint}' failed: {source}")]
    Send {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    /// The relay has been stopped
    #[error("Relay is stopped")]
    Stopped,

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new unknown-endpoint error
    pub fn unknown_endpoint(id: impl Into<String>) -> Self {
        Self::UnknownEndpoint(id.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convert from anyhow::Error (config file loading adds context with anyhow)
impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(format!("{:#}", err))
    }
}
