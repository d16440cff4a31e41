//! Logical connections.
//!
//! A [`Connection`] is assembled by the transport factory and owns its
//! transport, pipeline, managers and reporters. [`Connection::open`] moves it
//! through the lifecycle:
//!
//! ```text
//! Configuring -> Connecting -> Handshaking -> Connected <-> Degraded
//!       \             \              \            \           /
//!        `-------------`--------------`------------`--> Disconnected
//! ```
//!
//! and returns a cloneable [`ConnectionHandle`] for applications. Once
//! `Disconnected`, a connection never comes back; the registry builds a new
//! one instead.

mod context;
mod io;

pub use context::ConnectionContext;
pub(crate) use context::Outbound;

#[cfg(test)]
pub(crate) use context::testing;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::task::TaskTracker;

use crate::deliverability::DeliverabilityManager;
use crate::error::{Error, Result};
use crate::hint::ConnectionId;
use crate::metadata::MetadataReporter;
use crate::pipeline::Pipeline;
use crate::protocol::{MessageId, Packet, TypeTag, NAME};
use crate::query::QueryManager;
use crate::tracing::prelude::*;
use crate::transport::Transport;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Discovered,
    Configuring,
    Connecting,
    Handshaking,
    Connected,
    Degraded,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Discovered, Configuring)
            | (Configuring, Connecting)
            | (Connecting, Handshaking)
            | (Handshaking, Connected)
            | (Connected, Degraded)
            | (Degraded, Connected) => true,
            _ => false,
        }
    }

    /// Connected or degraded: the session is up.
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// An assembled, unopened connection.
pub struct Connection {
    ctx: Arc<ConnectionContext>,
    transport: Box<dyn Transport>,
    pipeline: Pipeline,
    outbound: mpsc::Receiver<Outbound>,
    deliverability: Arc<DeliverabilityManager>,
    queries: Arc<QueryManager>,
    reporters: Vec<Box<dyn MetadataReporter>>,
    handshake_timeout: Duration,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<ConnectionContext>,
        transport: Box<dyn Transport>,
        pipeline: Pipeline,
        outbound: mpsc::Receiver<Outbound>,
        deliverability: Arc<DeliverabilityManager>,
        queries: Arc<QueryManager>,
        reporters: Vec<Box<dyn MetadataReporter>>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            transport,
            pipeline,
            outbound,
            deliverability,
            queries,
            reporters,
            handshake_timeout,
        }
    }

    pub fn identity(&self) -> &ConnectionId {
        self.ctx.identity()
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.ctx
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.pipeline.stage_names()
    }

    pub fn reporter_names(&self) -> Vec<&'static str> {
        self.reporters.iter().map(|r| r.name()).collect()
    }

    /// Open the transport, run the handshake and start the reporters.
    ///
    /// Tasks are spawned on `tracker`. On failure the connection ends up
    /// `Disconnected` and the error is returned once.
    pub async fn open(self, tracker: &TaskTracker) -> Result<ConnectionHandle> {
        let Connection {
            ctx,
            mut transport,
            pipeline,
            outbound,
            deliverability,
            queries,
            reporters,
            handshake_timeout,
        } = self;

        ctx.transition(ConnectionState::Connecting);
        let link = match transport.open().await {
            Ok(link) => link,
            Err(e) => {
                let error = Error::TransportOpenFailure {
                    identity: ctx.identity().to_string(),
                    reason: e.to_string(),
                };
                ctx.fail(&error);
                return Err(error);
            }
        };
        debug!(identity = %ctx.identity(), transport = transport.name(), "Transport open.");

        tracker.spawn(
            io::IoTask {
                ctx: ctx.clone(),
                pipeline,
                link,
                outbound,
                deliverability: deliverability.clone(),
                queries: queries.clone(),
            }
            .run(),
        );

        let handle = ConnectionHandle {
            ctx: ctx.clone(),
            deliverability,
            queries,
        };

        ctx.transition(ConnectionState::Handshaking);
        for reporter in &reporters {
            ctx.merge_metadata(reporter.metadata());
        }

        let name = match handle.handshake(handshake_timeout).await {
            Ok(name) => name,
            Err(e) => {
                let error = if e.is_cancellation() {
                    Error::HandshakeTimeout {
                        identity: ctx.identity().to_string(),
                        timeout: handshake_timeout,
                    }
                } else {
                    e
                };
                ctx.fail(&error);
                return Err(error);
            }
        };
        ctx.set_metadata("deviceName", name.as_str());

        if !ctx.transition(ConnectionState::Connected) {
            return Err(Error::ConnectionClosed(ctx.identity().to_string()));
        }
        for reporter in &reporters {
            reporter.on_connected(&ctx, tracker);
        }
        info!(identity = %ctx.identity(), device = %name, "Connected.");

        Ok(handle)
    }
}

/// Application-facing handle to an open connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    ctx: Arc<ConnectionContext>,
    deliverability: Arc<DeliverabilityManager>,
    queries: Arc<QueryManager>,
}

impl ConnectionHandle {
    pub fn identity(&self) -> &ConnectionId {
        self.ctx.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.subscribe_state()
    }

    /// Application packets received from the device.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.ctx.subscribe()
    }

    /// Send a packet, retrying until acknowledged if it requests an ack.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.deliverability.send(packet).await
    }

    pub async fn query(&self, request: Packet, deadline: Duration) -> Result<Packet> {
        self.queries.query(request, deadline).await
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.ctx.metadata()
    }

    pub fn last_value(&self, message_id: &MessageId) -> Option<Value> {
        self.ctx.last_value(message_id)
    }

    /// Reason the connection failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.ctx.failure()
    }

    pub fn close(&self) {
        self.ctx.close();
    }

    /// Whether both handles refer to the same connection instance.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.ctx, &other.ctx)
    }

    /// Wait until the connection is disconnected.
    pub async fn closed(&self) {
        self.ctx.shutdown_token().cancelled().await;
    }

    async fn handshake(&self, timeout: Duration) -> Result<String> {
        let request = Packet::raw(NAME, TypeTag::Char, Bytes::new());
        let response = self.queries.query(request, timeout).await?;
        match response.as_value() {
            Some(Value::String(name)) => Ok(name.clone()),
            other => Err(Error::Protocol(format!(
                "identity response carried {:?}, expected text",
                other
            ))),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", self.identity())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use ConnectionState::*;

    #[test_case(Discovered, Configuring, true)]
    #[test_case(Configuring, Connecting, true)]
    #[test_case(Connecting, Handshaking, true)]
    #[test_case(Handshaking, Connected, true)]
    #[test_case(Connected, Degraded, true)]
    #[test_case(Degraded, Connected, true)]
    #[test_case(Handshaking, Disconnected, true)]
    #[test_case(Connecting, Connected, false)]
    #[test_case(Degraded, Handshaking, false)]
    #[test_case(Disconnected, Connected, false)]
    #[test_case(Disconnected, Disconnected, false)]
    fn test_transitions(from: ConnectionState, to: ConnectionState, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(Handshaking.to_string(), "handshaking");
        assert!(Degraded.is_established());
        assert!(!Connecting.is_established());
    }
}
