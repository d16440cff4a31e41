//! A scriptable device speaking the wire protocol over a loopback hub.
//!
//! `VirtualDevice` answers the identity query, echoes heartbeats,
//! acknowledges packets that ask for it, stores written values and answers
//! queries for them. Each behaviour can be switched off through
//! [`DeviceControls`] to simulate a misbehaving or unplugged board.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::CodecRegistry;
use crate::error::Result;
use crate::hint::{Hint, LOOPBACK_TRANSPORT_KEY};
use crate::pipeline::{
    BinaryStage, CodecStage, FragmentStage, FramingStage, Pipeline, PipelineBuilder,
    TypeCacheStage,
};
use crate::protocol::{internal, MessageId, Packet, TypeTag, NAME};
use crate::tracing::prelude::*;
use crate::transport::{LoopbackHub, LoopbackListener, TransportLink};
use crate::type_cache::TypeCache;

const MAX_PAYLOAD: usize = 100;
const MAX_FRAME: usize = 1024;

#[derive(Default)]
struct Shared {
    silent: AtomicBool,
    heartbeat_silent: AtomicBool,
    acks_silent: AtomicBool,
    heartbeat_delay_ms: AtomicU64,
    sessions: AtomicUsize,
    values: Mutex<HashMap<MessageId, (TypeTag, Value)>>,
    received: Mutex<Vec<Packet>>,
}

/// Switches and readouts for a running [`VirtualDevice`].
#[derive(Clone)]
pub struct DeviceControls {
    shared: Arc<Shared>,
    pushes: broadcast::Sender<Packet>,
}

impl DeviceControls {
    /// Ignore everything, as if the board hung.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_heartbeat_silent(&self, silent: bool) {
        self.shared.heartbeat_silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_acks_silent(&self, silent: bool) {
        self.shared.acks_silent.store(silent, Ordering::SeqCst);
    }

    /// Hold each heartbeat echo back by `delay`, like a congested link.
    /// The session answers nothing else meanwhile.
    pub fn set_heartbeat_delay(&self, delay: Duration) {
        self.shared
            .heartbeat_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Value returned by queries for `message_id`.
    pub fn set_value(&self, message_id: &str, type_tag: TypeTag, value: Value) {
        self.shared
            .values
            .lock()
            .insert(MessageId::from(message_id), (type_tag, value));
    }

    pub fn value(&self, message_id: &str) -> Option<Value> {
        self.shared
            .values
            .lock()
            .get(&MessageId::from(message_id))
            .map(|(_, v)| v.clone())
    }

    /// Send an unsolicited packet on every open session.
    pub fn push(&self, packet: Packet) {
        let _ = self.pushes.send(packet);
    }

    /// Application packets received so far, resends included.
    pub fn received(&self) -> Vec<Packet> {
        self.shared.received.lock().clone()
    }

    /// Sessions accepted since start.
    pub fn sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }
}

pub struct VirtualDevice {
    name: String,
    endpoint: String,
    listener: LoopbackListener,
    controls: DeviceControls,
}

impl VirtualDevice {
    /// Create a device called `name` listening on `endpoint`.
    pub fn new(name: &str, hub: &LoopbackHub, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            listener: hub.listen(endpoint),
            controls: DeviceControls {
                shared: Arc::new(Shared::default()),
                pushes: broadcast::channel(16).0,
            },
        }
    }

    /// The hint a producer would emit for this device.
    pub fn hint(&self) -> Hint {
        Hint::new(LOOPBACK_TRANSPORT_KEY)
            .with_identification("endpoint", self.endpoint.as_str())
            .available()
    }

    pub fn controls(&self) -> DeviceControls {
        self.controls.clone()
    }

    /// Serve sessions on `tracker` until `shutdown` is cancelled.
    pub fn spawn(self, tracker: &TaskTracker, shutdown: CancellationToken) -> DeviceControls {
        let controls = self.controls();
        let sessions = tracker.clone();
        tracker.spawn(self.run(sessions, shutdown));
        controls
    }

    async fn run(mut self, tracker: TaskTracker, shutdown: CancellationToken) {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = self.listener.accept() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            self.controls.shared.sessions.fetch_add(1, Ordering::SeqCst);
            debug!(device = %self.name, endpoint = %self.endpoint, "Session accepted.");

            match Session::new(self.name.clone(), stream, self.controls.clone()) {
                Ok(session) => {
                    tracker.spawn(session.run(shutdown.clone()));
                }
                Err(e) => error!(device = %self.name, error = %e, "Session setup failed."),
            }
        }
    }
}

struct Session {
    name: String,
    link: TransportLink,
    pipeline: Pipeline,
    controls: DeviceControls,
}

impl Session {
    fn new(name: String, stream: DuplexStream, controls: DeviceControls) -> Result<Self> {
        let pipeline = PipelineBuilder::new()
            .stage(FramingStage::new(MAX_FRAME))
            .stage(BinaryStage)
            .stage(FragmentStage::new(MAX_PAYLOAD)?)
            .stage(CodecStage::new(CodecRegistry::with_defaults([]), false)?)
            .stage(TypeCacheStage::new(TypeCache::new()))
            .finalize()?;
        Ok(Self {
            name,
            link: TransportLink::from_io(stream),
            pipeline,
            controls,
        })
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let mut pushes = self.controls.pushes.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                chunk = self.link.reader.next() => match chunk {
                    Some(Ok(chunk)) => {
                        let decoded = self.pipeline.decode(chunk);
                        for packet in decoded.packets {
                            for reply in self.respond(packet) {
                                if reply.internal && reply.message_id.as_str() == internal::HEARTBEAT {
                                    let delay = self.controls.shared.heartbeat_delay_ms.load(Ordering::SeqCst);
                                    if delay > 0 {
                                        time::sleep(Duration::from_millis(delay)).await;
                                    }
                                }
                                self.send(reply).await;
                            }
                        }
                    }
                    _ => break,
                },
                push = pushes.recv() => {
                    if let Ok(packet) = push {
                        self.send(packet).await;
                    }
                }
            }
        }
        trace!(device = %self.name, "Session ended.");
    }

    fn respond(&self, packet: Packet) -> Vec<Packet> {
        let shared = &self.controls.shared;
        if shared.silent.load(Ordering::SeqCst) {
            return Vec::new();
        }

        if packet.internal {
            let is_ping = packet.query && packet.message_id.as_str() == internal::HEARTBEAT;
            if is_ping && !shared.heartbeat_silent.load(Ordering::SeqCst) {
                let mut echo = packet;
                echo.query = false;
                return vec![echo];
            }
            return Vec::new();
        }

        shared.received.lock().push(packet.clone());
        let mut replies = Vec::new();

        if packet.ack && packet.ack_num != 0 && !shared.acks_silent.load(Ordering::SeqCst) {
            let mut ack = Packet::raw(packet.message_id.clone(), TypeTag::Callback, Bytes::new())
                .as_internal()
                .with_ack();
            ack.ack_num = packet.ack_num;
            replies.push(ack);
        }

        if packet.query {
            if packet.message_id.as_str() == NAME {
                replies.push(Packet::value(NAME, TypeTag::Char, Value::from(self.name.as_str())));
            } else if let Some((tag, value)) = shared.values.lock().get(&packet.message_id) {
                replies.push(Packet::value(packet.message_id.clone(), *tag, value.clone()));
            }
        } else if let Some(value) = packet.as_value() {
            shared
                .values
                .lock()
                .insert(packet.message_id.clone(), (packet.type_tag, value.clone()));
        }
        replies
    }

    async fn send(&mut self, packet: Packet) {
        let frames = match self.pipeline.encode(packet) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(device = %self.name, error = %e, "Reply not encoded.");
                return;
            }
        };
        for frame in frames {
            if let Err(e) = self.link.writer.send(frame).await {
                debug!(device = %self.name, error = %e, "Reply not sent.");
                return;
            }
        }
    }
}
