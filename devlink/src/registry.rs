//! Connection registry.
//!
//! The registry turns hints into connections and tracks them until they
//! close. It guarantees at most one connection per identity: an identity is
//! reserved before any asynchronous work starts and released when the
//! attempt fails or the connection disconnects.
//!
//! New connections are built from the current [`Blueprint`]. Replacing the
//! blueprint is an atomic swap that affects only connections built
//! afterwards.
//!
//! Error propagation follows the hint's origin. Discovery-driven attempts
//! ([`ConnectionRegistry::offer_hint`]) only log failures. Explicit attempts
//! ([`ConnectionRegistry::connect_hint`]) return the error once to the
//! caller. Either way, subscribers see [`RegistryEvent::Failed`].

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::connection::{ConnectionContext, ConnectionHandle, ConnectionState};
use crate::consumer::{self, HintConsumer};
use crate::discovery::DiscoveryEvent;
use crate::error::{Error, Result};
use crate::hint::{ConnectionId, Hint};
use crate::tracing::prelude::*;
use crate::transport::LoopbackHub;

const EVENT_DEPTH: usize = 64;

/// How new connections are built.
pub struct Blueprint {
    consumers: Vec<Arc<dyn HintConsumer>>,
    /// Connect to hints not flagged available.
    pub auto_connect: bool,
    /// Deadline for discovery-driven connection attempts.
    pub connect_deadline: Duration,
}

impl Blueprint {
    pub fn new(consumers: Vec<Arc<dyn HintConsumer>>) -> Self {
        Self {
            consumers,
            auto_connect: true,
            connect_deadline: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config, hub: Option<LoopbackHub>) -> Result<Self> {
        Ok(Self {
            consumers: consumer::from_config(config, hub)?,
            auto_connect: config.discovery.auto_connect,
            connect_deadline: config.discovery.connect_deadline(),
        })
    }

    pub fn consumers(&self) -> &[Arc<dyn HintConsumer>] {
        &self.consumers
    }

    pub fn select(&self, hint: &Hint) -> Option<&Arc<dyn HintConsumer>> {
        consumer::select(&self.consumers, hint)
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A consumer accepted a hint and the connection is being built.
    Connecting { identity: ConnectionId },
    /// Handshake complete.
    Connected { identity: ConnectionId, handle: ConnectionHandle },
    StateChanged {
        identity: ConnectionId,
        state: ConnectionState,
    },
    /// The attempt failed before reaching `Connected`.
    Failed { identity: ConnectionId, error: String },
    /// An established connection went away.
    Closed {
        identity: ConnectionId,
        reason: Option<String>,
    },
}

/// An identity held while its connection is being built.
///
/// Unless committed, dropping it frees the identity and closes the
/// half-built connection.
struct Reservation {
    registry: ConnectionRegistry,
    identity: ConnectionId,
    ctx: Option<Arc<ConnectionContext>>,
    committed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        {
            let mut entries = self.registry.inner.entries.lock();
            if matches!(entries.get(&self.identity), Some(Entry::Pending)) {
                entries.remove(&self.identity);
            }
        }
        if let Some(ctx) = &self.ctx {
            ctx.close();
        }
    }
}

enum Entry {
    Pending,
    Live { handle: ConnectionHandle, hint: Hint },
}

struct Inner {
    blueprint: ArcSwap<Blueprint>,
    entries: Mutex<HashMap<ConnectionId, Entry>>,
    events: broadcast::Sender<RegistryEvent>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Owns every connection's lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(blueprint: Blueprint) -> Self {
        Self::with_shutdown(blueprint, CancellationToken::new())
    }

    /// Registry whose connections all stop when `shutdown` is cancelled.
    pub fn with_shutdown(blueprint: Blueprint, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                blueprint: ArcSwap::from_pointee(blueprint),
                entries: Mutex::new(HashMap::new()),
                events: broadcast::channel(EVENT_DEPTH).0,
                tracker: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    /// Use `blueprint` for every connection built from now on. Live
    /// connections keep the settings they were built with.
    pub fn reconfigure(&self, blueprint: Blueprint) {
        self.inner.blueprint.store(Arc::new(blueprint));
        info!("Connection blueprint replaced.");
    }

    pub fn blueprint(&self) -> Arc<Blueprint> {
        self.inner.blueprint.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn get(&self, identity: &ConnectionId) -> Option<ConnectionHandle> {
        match self.inner.entries.lock().get(identity) {
            Some(Entry::Live { handle, .. }) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        let entries = self.inner.entries.lock();
        let mut handles: Vec<ConnectionHandle> = entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Live { handle, .. } => Some(handle.clone()),
                Entry::Pending => None,
            })
            .collect();
        handles.sort_by(|a, b| a.identity().cmp(b.identity()));
        handles
    }

    /// Connect to a hint, giving up after `deadline`.
    ///
    /// A deadline expiry yields [`Error::ConnectCancelled`], which
    /// [`Error::is_cancellation`] tells apart from a device or transport
    /// failure.
    ///
    /// Dropping the returned future gives the identity back and closes
    /// whatever part of the connection was already built.
    pub async fn connect_hint(&self, hint: Hint, deadline: Duration) -> Result<ConnectionHandle> {
        let identity = hint.identity();
        let mut reservation = self.reserve(&identity)?;
        self.emit(RegistryEvent::StateChanged {
            identity: identity.clone(),
            state: ConnectionState::Discovered,
        });

        match self.establish(&mut reservation, &hint, deadline).await {
            Ok(handle) => {
                reservation.committed = true;
                self.inner.entries.lock().insert(
                    identity.clone(),
                    Entry::Live {
                        handle: handle.clone(),
                        hint,
                    },
                );
                self.watch(handle.clone());
                self.emit(RegistryEvent::Connected {
                    identity,
                    handle: handle.clone(),
                });
                Ok(handle)
            }
            Err(e) => {
                drop(reservation);
                self.emit(RegistryEvent::Failed {
                    identity,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Discovery entry point: connect in the background if the blueprint
    /// wants this hint. Failures are logged and never escalate.
    pub fn offer_hint(&self, hint: Hint) {
        let blueprint = self.blueprint();
        if !hint.is_available() && !blueprint.auto_connect {
            debug!(identity = %hint.identity(), "Hint not available, skipping.");
            return;
        }
        if blueprint.select(&hint).is_none() {
            debug!(
                identity = %hint.identity(),
                transport = hint.transport_key(),
                "No consumer for hint, dropping."
            );
            return;
        }
        if self.inner.entries.lock().contains_key(&hint.identity()) {
            trace!(identity = %hint.identity(), "Already tracked.");
            return;
        }

        let registry = self.clone();
        let deadline = blueprint.connect_deadline;
        self.inner.tracker.spawn(async move {
            let identity = hint.identity();
            match registry.connect_hint(hint, deadline).await {
                Ok(_) => {}
                Err(Error::DuplicateIdentity(_)) => {
                    trace!(identity = %identity, "Lost race for identity.");
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Connection attempt failed.");
                }
            }
        });
    }

    /// The endpoint behind `identity` went away.
    pub fn remove(&self, identity: &ConnectionId) -> bool {
        match self.get(identity) {
            Some(handle) => {
                info!(identity = %identity, "Endpoint gone, closing connection.");
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn close(&self, identity: &ConnectionId) -> bool {
        match self.get(identity) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Replace the connection for `identity` with a fresh one built from the
    /// hint it was created from and the current blueprint.
    pub async fn reconnect(&self, identity: &ConnectionId) -> Result<ConnectionHandle> {
        let (handle, hint) = match self.inner.entries.lock().get(identity) {
            Some(Entry::Live { handle, hint }) => (handle.clone(), hint.clone()),
            _ => return Err(Error::ConnectionClosed(identity.to_string())),
        };

        info!(identity = %identity, "Reconnecting.");
        handle.close();
        if self.release(identity, &handle) {
            self.emit(RegistryEvent::Closed {
                identity: identity.clone(),
                reason: Some("replaced by reconnect".into()),
            });
        }

        let deadline = self.blueprint().connect_deadline;
        self.connect_hint(hint, deadline).await
    }

    /// Consume discovery events until shutdown or until the channel closes.
    pub async fn run_discovery(&self, mut events: mpsc::Receiver<DiscoveryEvent>) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(DiscoveryEvent::Found(hint)) => self.offer_hint(hint),
                    Some(DiscoveryEvent::Gone(identity)) => {
                        self.remove(&identity);
                    }
                    None => break,
                },
            }
        }
        trace!("Discovery loop stopped.");
    }

    /// Close every connection and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for handle in self.connections() {
            handle.close();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    fn reserve(&self, identity: &ConnectionId) -> Result<Reservation> {
        let mut entries = self.inner.entries.lock();
        let stale = match entries.get(identity) {
            None => true,
            Some(Entry::Live { handle, .. }) => handle.state() == ConnectionState::Disconnected,
            Some(Entry::Pending) => false,
        };
        if !stale {
            return Err(Error::DuplicateIdentity(identity.to_string()));
        }
        entries.insert(identity.clone(), Entry::Pending);
        Ok(Reservation {
            registry: self.clone(),
            identity: identity.clone(),
            ctx: None,
            committed: false,
        })
    }

    /// Drop the entry for `identity` if it still refers to `handle`.
    fn release(&self, identity: &ConnectionId, handle: &ConnectionHandle) -> bool {
        let mut entries = self.inner.entries.lock();
        let current = matches!(
            entries.get(identity),
            Some(Entry::Live { handle: live, .. }) if live.same_connection(handle)
        );
        if current {
            entries.remove(identity);
        }
        current
    }

    async fn establish(
        &self,
        reservation: &mut Reservation,
        hint: &Hint,
        deadline: Duration,
    ) -> Result<ConnectionHandle> {
        let identity = reservation.identity.clone();
        let blueprint = self.blueprint();
        let consumer = blueprint
            .select(hint)
            .ok_or_else(|| Error::NoMatchingConsumer {
                transport_key: hint.transport_key().to_string(),
            })?;
        debug!(identity = %identity, consumer = consumer.name(), "Consumer accepted hint.");

        self.emit(RegistryEvent::StateChanged {
            identity: identity.clone(),
            state: ConnectionState::Configuring,
        });
        let options = consumer.configure(hint)?;
        let connection = consumer.factory().build(
            identity.clone(),
            options,
            self.inner.shutdown.child_token(),
        )?;
        let ctx = connection.context().clone();
        reservation.ctx = Some(ctx.clone());

        self.emit(RegistryEvent::Connecting {
            identity: identity.clone(),
        });
        let forward = self.forward_states(identity.clone(), ctx.subscribe_state());

        let result = match time::timeout(deadline, connection.open(&self.inner.tracker)).await {
            Ok(result) => result,
            Err(_) => {
                ctx.close();
                Err(Error::ConnectCancelled {
                    identity: identity.to_string(),
                    deadline,
                })
            }
        };
        if result.is_err() {
            forward.abort();
        }
        result
    }

    /// Re-emit state changes of one connection as registry events.
    fn forward_states(
        &self,
        identity: ConnectionId,
        mut states: tokio::sync::watch::Receiver<ConnectionState>,
    ) -> tokio::task::JoinHandle<()> {
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let _ = events.send(RegistryEvent::StateChanged {
                    identity: identity.clone(),
                    state,
                });
                if state == ConnectionState::Disconnected {
                    break;
                }
            }
        })
    }

    /// Release the identity once the connection disconnects.
    fn watch(&self, handle: ConnectionHandle) {
        let registry = self.clone();
        self.inner.tracker.spawn(async move {
            handle.closed().await;
            let identity = handle.identity().clone();
            if registry.release(&identity, &handle) {
                info!(identity = %identity, "Connection closed.");
                registry.emit(RegistryEvent::Closed {
                    identity,
                    reason: handle.failure(),
                });
            }
        });
    }

    fn emit(&self, event: RegistryEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hint::{LOOPBACK_TRANSPORT_KEY, SERIAL_TRANSPORT_KEY};

    fn registry_with_hub(hub: LoopbackHub) -> ConnectionRegistry {
        ConnectionRegistry::new(Blueprint::from_config(&Config::default(), Some(hub)).unwrap())
    }

    #[tokio::test]
    async fn test_unmatched_hint_is_rejected() {
        let registry = registry_with_hub(LoopbackHub::new());
        let result = registry
            .connect_hint(Hint::new("bluetooth-le"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::NoMatchingConsumer { .. })));
        assert!(registry.connections().is_empty());
    }

    #[tokio::test]
    async fn test_failed_open_releases_identity() {
        let registry = registry_with_hub(LoopbackHub::new());
        let hint = Hint::new(LOOPBACK_TRANSPORT_KEY).with_identification("endpoint", "absent");
        let mut events = registry.subscribe();

        let result = registry.connect_hint(hint.clone(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::TransportOpenFailure { .. })));

        // Same identity may be tried again.
        let again = registry.connect_hint(hint, Duration::from_secs(1)).await;
        assert!(matches!(again, Err(Error::TransportOpenFailure { .. })));

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RegistryEvent::Failed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_pending_identity_is_exclusive() {
        let registry = registry_with_hub(LoopbackHub::new());
        let identity = ConnectionId::from("serial:comPath=/dev/ttyUSB0");
        let _held = registry.reserve(&identity).unwrap();

        let hint = Hint::new(SERIAL_TRANSPORT_KEY).with_identification("comPath", "/dev/ttyUSB0");
        let result = registry.connect_hint(hint, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::DuplicateIdentity(_))));
    }

    #[tokio::test]
    async fn test_reconfigure_swaps_blueprint() {
        let registry = registry_with_hub(LoopbackHub::new());
        assert_eq!(registry.blueprint().consumers().len(), 4);

        let mut config = Config::default();
        config.discovery.auto_connect = false;
        registry.reconfigure(Blueprint::from_config(&config, None).unwrap());

        assert_eq!(registry.blueprint().consumers().len(), 3);
        assert!(!registry.blueprint().auto_connect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_connect_frees_identity() {
        let hub = LoopbackHub::new();
        // Accepts the transport but never answers the handshake.
        let _listener = hub.listen("mute");
        let registry = registry_with_hub(hub);
        let hint = Hint::new(LOOPBACK_TRANSPORT_KEY).with_identification("endpoint", "mute");

        let first = time::timeout(
            Duration::from_millis(500),
            registry.connect_hint(hint.clone(), Duration::from_secs(30)),
        )
        .await;
        assert!(first.is_err());
        assert!(registry.inner.entries.lock().is_empty());

        let second = registry.connect_hint(hint, Duration::from_secs(1)).await;
        assert!(matches!(second, Err(Error::ConnectCancelled { .. })));
    }
}
