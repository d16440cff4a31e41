//! In-process transport for virtual devices.
//!
//! A [`LoopbackHub`] is a named rendezvous point. A device listens on an
//! endpoint name; opening a loopback transport to that name creates an
//! in-memory duplex pipe and hands the far end to the listener.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{Transport, TransportLink};
use crate::error::Result;
use crate::tracing::prelude::*;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    endpoints: Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections on `endpoint`, replacing any earlier
    /// listener with the same name.
    pub fn listen(&self, endpoint: &str) -> LoopbackListener {
        let (tx, rx) = mpsc::channel(4);
        self.endpoints.lock().insert(endpoint.to_string(), tx);
        LoopbackListener { incoming: rx }
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.lock().keys().cloned().collect();
        names.sort();
        names
    }

    async fn connect(&self, endpoint: &str) -> io::Result<DuplexStream> {
        let listener = self.endpoints.lock().get(endpoint).cloned();
        let Some(listener) = listener else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no loopback listener on '{endpoint}'"),
            ));
        };
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        listener.send(far).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("loopback listener on '{endpoint}' is gone"),
            )
        })?;
        Ok(near)
    }
}

/// Device side of a loopback endpoint.
#[derive(Debug)]
pub struct LoopbackListener {
    incoming: mpsc::Receiver<DuplexStream>,
}

impl LoopbackListener {
    /// Wait for the next host connection.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming.recv().await
    }
}

pub struct LoopbackTransport {
    endpoint: String,
    hub: LoopbackHub,
}

impl LoopbackTransport {
    pub fn new(endpoint: String, hub: LoopbackHub) -> Self {
        Self { endpoint, hub }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn open(&mut self) -> Result<TransportLink> {
        let stream = self.hub.connect(&self.endpoint).await?;
        trace!(endpoint = %self.endpoint, "Loopback connected.");
        Ok(TransportLink::from_io(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bytes_cross_the_pipe() {
        let hub = LoopbackHub::new();
        let mut listener = hub.listen("bench");
        let mut transport = LoopbackTransport::new("bench".into(), hub.clone());

        let mut link = transport.open().await.unwrap();
        let mut device = listener.accept().await.unwrap();

        link.writer.send(Bytes::from_static(b"ping")).await.unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        device.write_all(b"pong").await.unwrap();
        let chunk = link.reader.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"pong");
    }

    #[tokio::test]
    async fn test_missing_listener_is_refused() {
        let mut transport = LoopbackTransport::new("nobody".into(), LoopbackHub::new());
        assert!(transport.open().await.is_err());
    }
}
