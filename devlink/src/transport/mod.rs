//! Physical transports.
//!
//! A transport turns [`TransportOptions`] into a raw byte link: a stream of
//! inbound chunks and a sink for outbound frames. Transports know nothing
//! about framing or packets; the pipeline sits on top of the link.

pub mod loopback;
pub mod serial;
pub mod tcp;
pub mod websocket;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use futures::Sink;
use serde_json::{Map, Value};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};

use crate::error::Result;
use crate::hint::{
    LOOPBACK_TRANSPORT_KEY, SERIAL_TRANSPORT_KEY, TCP_TRANSPORT_KEY, WEBSOCKETS_TRANSPORT_KEY,
};

pub use loopback::{LoopbackHub, LoopbackListener};

/// Outbound half of an open link.
pub type LinkSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

/// An open byte link.
pub struct TransportLink {
    pub reader: BoxStream<'static, io::Result<Bytes>>,
    pub writer: LinkSink,
}

impl TransportLink {
    /// Wrap any async byte stream.
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(read_half, BytesCodec::new())
            .map(|chunk| chunk.map(BytesMut::freeze))
            .boxed();
        let writer = Box::pin(FramedWrite::new(write_half, BytesCodec::new()));
        Self { reader, writer }
    }
}

#[async_trait]
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    /// Open the underlying medium. Called once per connection.
    async fn open(&mut self) -> Result<TransportLink>;
}

/// Transport parameters derived from a hint by a consumer.
#[derive(Debug, Clone)]
pub enum TransportOptions {
    Serial {
        com_path: String,
        baud_rate: u32,
        attachment_delay: Duration,
    },
    WebSocket {
        uri: String,
    },
    Tcp {
        addr: String,
    },
    Loopback {
        endpoint: String,
        hub: LoopbackHub,
    },
}

impl TransportOptions {
    pub fn transport_key(&self) -> &'static str {
        match self {
            TransportOptions::Serial { .. } => SERIAL_TRANSPORT_KEY,
            TransportOptions::WebSocket { .. } => WEBSOCKETS_TRANSPORT_KEY,
            TransportOptions::Tcp { .. } => TCP_TRANSPORT_KEY,
            TransportOptions::Loopback { .. } => LOOPBACK_TRANSPORT_KEY,
        }
    }

    /// Metadata advertised by the static reporter.
    pub fn static_metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        match self {
            TransportOptions::Serial {
                com_path,
                baud_rate,
                ..
            } => {
                metadata.insert("name".into(), "Serial".into());
                metadata.insert("comPath".into(), com_path.as_str().into());
                metadata.insert("baudRate".into(), (*baud_rate).into());
            }
            TransportOptions::WebSocket { uri } => {
                metadata.insert("name".into(), "WebSockets".into());
                metadata.insert("uri".into(), uri.as_str().into());
            }
            TransportOptions::Tcp { addr } => {
                metadata.insert("name".into(), "TCP".into());
                metadata.insert("addr".into(), addr.as_str().into());
            }
            TransportOptions::Loopback { endpoint, .. } => {
                metadata.insert("name".into(), "Loopback".into());
                metadata.insert("endpoint".into(), endpoint.as_str().into());
            }
        }
        metadata
    }

    /// Consume the options into an unopened transport.
    pub fn into_transport(self) -> Box<dyn Transport> {
        match self {
            TransportOptions::Serial {
                com_path,
                baud_rate,
                attachment_delay,
            } => Box::new(serial::SerialTransport::new(com_path, baud_rate, attachment_delay)),
            TransportOptions::WebSocket { uri } => Box::new(websocket::WebSocketTransport::new(uri)),
            TransportOptions::Tcp { addr } => Box::new(tcp::TcpTransport::new(addr)),
            TransportOptions::Loopback { endpoint, hub } => {
                Box::new(loopback::LoopbackTransport::new(endpoint, hub))
            }
        }
    }
}
