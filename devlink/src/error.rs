//! Common error types for devlink.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from underlying error types used throughout the crate. The
//! connection-level variants follow the propagation policy of the registry:
//! discovery errors stay with the hint, construction and handshake errors
//! reach the requester once, and steady-state degradation is reported as
//! state changes rather than errors.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::{MessageId, TypeTag};

/// Main error type for devlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No registered consumer accepted the hint
    #[error("No consumer accepts hints for transport '{transport_key}'")]
    NoMatchingConsumer { transport_key: String },

    /// The transport could not be opened
    #[error("Failed to open transport for {identity}: {reason}")]
    TransportOpenFailure { identity: String, reason: String },

    /// The device did not answer the identity query in time
    #[error("Handshake with {identity} timed out after {timeout:?}")]
    HandshakeTimeout { identity: String, timeout: Duration },

    /// An acknowledged send was never acknowledged
    #[error("Delivery of '{message_id}' failed after {attempts} attempts")]
    DeliverabilityExhausted { message_id: MessageId, attempts: u32 },

    /// Packet identifier is neither allow-listed nor in the type cache
    #[error("Undefined message identifier '{0}'")]
    UndefinedMessageIdentifier(MessageId),

    /// No codec claims the packet
    #[error("No codec matches '{message_id}' with type {type_tag}")]
    CodecMismatch { message_id: MessageId, type_tag: TypeTag },

    /// Heartbeats stayed unanswered past the grace period
    #[error("Heartbeat timeout on {identity}")]
    HeartbeatTimeout { identity: String },

    /// A query reached its local deadline without a response
    #[error("Query '{message_id}' cancelled after {deadline:?} without response")]
    QueryCancelled { message_id: MessageId, deadline: Duration },

    /// A connection attempt reached its local deadline
    #[error("Connection attempt for {identity} cancelled after {deadline:?}")]
    ConnectCancelled { identity: String, deadline: Duration },

    /// A connection for this identity already exists or is being set up
    #[error("A connection for {0} already exists")]
    DuplicateIdentity(String),

    /// The connection went away while the operation was in flight
    #[error("Connection {0} closed")]
    ConnectionClosed(String),

    /// Frame boundary or byte-stuffing errors
    #[error("Framing error: {0}")]
    Framing(String),

    /// Malformed packets
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A connection could not be assembled
    #[error("Construction error: {0}")]
    Construction(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error was caused by a local deadline rather than by the
    /// device or the transport.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::QueryCancelled { .. } | Error::ConnectCancelled { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinguished() {
        let cancelled = Error::QueryCancelled {
            message_id: MessageId::from("name"),
            deadline: Duration::from_secs(10),
        };
        assert!(cancelled.is_cancellation());

        let remote = Error::Protocol("device reported failure".into());
        assert!(!remote.is_cancellation());

        let closed = Error::ConnectionClosed("serial:/dev/ttyUSB0".into());
        assert!(!closed.is_cancellation());
    }
}
