use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use std::io;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use super::{Transport, TransportLink};
use crate::error::Result;
use crate::tracing::prelude::*;

/// WebSocket client transport. Frames travel as binary messages.
pub struct WebSocketTransport {
    uri: String,
}

impl WebSocketTransport {
    pub fn new(uri: String) -> Self {
        Self { uri }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websockets"
    }

    async fn open(&mut self) -> Result<TransportLink> {
        let (socket, _response) = connect_async(self.uri.as_str()).await?;
        debug!(uri = %self.uri, "WebSocket connected.");

        let (sink, stream) = socket.split();

        let reader = stream
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                    Ok(Message::Close(_)) => None,
                    Ok(other) => {
                        trace!(kind = ?other, "Ignoring non-binary WebSocket message.");
                        None
                    }
                    Err(e) => Some(Err(io::Error::other(e))),
                })
            })
            .boxed();

        let writer = sink
            .with(|frame: Bytes| {
                future::ready(Ok::<_, tungstenite::Error>(Message::binary(frame.to_vec())))
            })
            .sink_map_err(io::Error::other);

        Ok(TransportLink {
            reader,
            writer: Box::pin(writer),
        })
    }
}
