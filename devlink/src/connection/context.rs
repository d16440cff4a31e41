use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::ConnectionState;
use crate::error::{Error, Result};
use crate::hint::ConnectionId;
use crate::protocol::{MessageId, Packet};
use crate::tracing::prelude::*;
use crate::type_cache::TypeCache;

const OUTBOUND_DEPTH: usize = 64;
const INBOUND_DEPTH: usize = 256;
const ECHO_DEPTH: usize = 16;

/// A packet queued for the I/O task, with a slot for the write result.
pub(crate) struct Outbound {
    pub packet: Packet,
    pub done: oneshot::Sender<Result<()>>,
}

/// State shared by a connection's task, managers and handles.
///
/// Managers and reporters hold an `Arc` to this; the context itself holds
/// no reference back to them.
pub struct ConnectionContext {
    identity: ConnectionId,
    state: watch::Sender<ConnectionState>,
    type_cache: TypeCache,
    metadata: RwLock<Map<String, Value>>,
    last_values: RwLock<HashMap<MessageId, Value>>,
    outbound: mpsc::Sender<Outbound>,
    inbound: broadcast::Sender<Packet>,
    echoes: broadcast::Sender<u8>,
    failure: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl ConnectionContext {
    pub(crate) fn new(
        identity: ConnectionId,
        type_cache: TypeCache,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let ctx = Self {
            identity,
            state: watch::channel(ConnectionState::Configuring).0,
            type_cache,
            metadata: RwLock::new(Map::new()),
            last_values: RwLock::new(HashMap::new()),
            outbound,
            inbound: broadcast::channel(INBOUND_DEPTH).0,
            echoes: broadcast::channel(ECHO_DEPTH).0,
            failure: Mutex::new(None),
            shutdown,
        };
        (Arc::new(ctx), outbound_rx)
    }

    pub fn identity(&self) -> &ConnectionId {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn type_cache(&self) -> &TypeCache {
        &self.type_cache
    }

    /// Move to `next` if the lifecycle allows it. Returns whether the state
    /// changed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            info!(identity = %self.identity, %from, to = %next, "Connection state changed.");
        }
        changed
    }

    /// Queue a packet for the I/O task and wait until it is written.
    pub(crate) async fn transmit(&self, packet: Packet) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(self.closed());
        }
        let (done, written) = oneshot::channel();
        self.outbound
            .send(Outbound { packet, done })
            .await
            .map_err(|_| self.closed())?;
        written.await.map_err(|_| self.closed())?
    }

    /// Hand an application packet to subscribers.
    pub(crate) fn deliver(&self, packet: Packet) {
        if let Some(value) = packet.as_value() {
            self.last_values
                .write()
                .insert(packet.message_id.clone(), value.clone());
        }
        // No subscribers is fine.
        let _ = self.inbound.send(packet);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.inbound.subscribe()
    }

    pub fn last_value(&self, message_id: &MessageId) -> Option<Value> {
        self.last_values.read().get(message_id).cloned()
    }

    pub(crate) fn heartbeat_echo(&self, counter: u8) {
        let _ = self.echoes.send(counter);
    }

    pub(crate) fn heartbeat_echoes(&self) -> broadcast::Receiver<u8> {
        self.echoes.subscribe()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.metadata.read().clone()
    }

    pub(crate) fn merge_metadata(&self, fields: Map<String, Value>) {
        self.metadata.write().extend(fields);
    }

    pub(crate) fn set_metadata(&self, key: &str, value: impl Into<Value>) {
        self.metadata.write().insert(key.to_string(), value.into());
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reason recorded by the first failure, if the connection failed.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Tear down after an unrecoverable error.
    pub(crate) fn fail(&self, error: &Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                warn!(identity = %self.identity, error = %error, "Connection failed.");
                *failure = Some(error.to_string());
            }
        }
        self.close();
    }

    pub(crate) fn close(&self) {
        self.transition(ConnectionState::Disconnected);
        self.shutdown.cancel();
    }

    fn closed(&self) -> Error {
        Error::ConnectionClosed(self.identity.to_string())
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A context whose outbound queue is drained by the returned task,
    /// answering every write with `Ok` and recording the packets.
    pub(crate) fn drained_context() -> (Arc<ConnectionContext>, Arc<Mutex<Vec<Packet>>>) {
        let (ctx, mut outbound) = ConnectionContext::new(
            ConnectionId::from("loopback:endpoint=test"),
            TypeCache::new(),
            CancellationToken::new(),
        );
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        tokio::spawn(async move {
            while let Some(out) = outbound.recv().await {
                sink.lock().push(out.packet);
                let _ = out.done.send(Ok(()));
            }
        });
        (ctx, written)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::drained_context;
    use super::*;
    use crate::protocol::TypeTag;

    #[tokio::test]
    async fn test_transmit_after_close_fails() {
        let (ctx, written) = drained_context();
        ctx.transmit(Packet::raw("led", TypeTag::Uint8, vec![1]))
            .await
            .unwrap();
        ctx.close();

        let result = ctx.transmit(Packet::raw("led", TypeTag::Uint8, vec![0])).await;
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
        assert_eq!(written.lock().len(), 1);
        assert_eq!(ctx.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_deliver_keeps_last_value() {
        let (ctx, _) = drained_context();
        let mut rx = ctx.subscribe();
        ctx.deliver(Packet::value("temp", TypeTag::Int16, serde_json::json!(21)));
        ctx.deliver(Packet::value("temp", TypeTag::Int16, serde_json::json!(22)));

        assert_eq!(ctx.last_value(&MessageId::from("temp")), Some(serde_json::json!(22)));
        assert_eq!(rx.recv().await.unwrap().as_value(), Some(&serde_json::json!(21)));
    }

    #[tokio::test]
    async fn test_first_failure_is_kept() {
        let (ctx, _) = drained_context();
        ctx.fail(&Error::HeartbeatTimeout {
            identity: "a".into(),
        });
        ctx.fail(&Error::Protocol("later".into()));
        assert_eq!(ctx.failure().as_deref(), Some("Heartbeat timeout on a"));
    }
}
