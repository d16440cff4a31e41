use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::context::{ConnectionContext, Outbound};
use crate::deliverability::DeliverabilityManager;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::protocol::{internal, Packet, TypeTag};
use crate::query::QueryManager;
use crate::tracing::prelude::*;
use crate::transport::TransportLink;

/// The single processing path of one connection: every encode and decode
/// happens here, in order.
pub(crate) struct IoTask {
    pub ctx: Arc<ConnectionContext>,
    pub pipeline: Pipeline,
    pub link: TransportLink,
    pub outbound: mpsc::Receiver<Outbound>,
    pub deliverability: Arc<DeliverabilityManager>,
    pub queries: Arc<QueryManager>,
}

impl IoTask {
    pub async fn run(mut self) {
        let shutdown = self.ctx.shutdown_token();
        trace!(identity = %self.ctx.identity(), "I/O task started.");

        let failure = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break None,
                chunk = self.link.reader.next() => match chunk {
                    Some(Ok(chunk)) => self.handle_chunk(chunk).await,
                    Some(Err(e)) => break Some(Error::Io(e)),
                    None => break Some(Error::ConnectionClosed(self.ctx.identity().to_string())),
                },
                Some(out) = self.outbound.recv() => {
                    let result = self.write(out.packet).await;
                    let _ = out.done.send(result);
                }
            }
        };

        match failure {
            Some(e) => self.ctx.fail(&e),
            None => self.ctx.close(),
        }
        self.queries.cancel_all();
        self.deliverability.cancel_all();
        if let Err(e) = self.link.writer.close().await {
            debug!(identity = %self.ctx.identity(), error = %e, "Error closing transport.");
        }
        trace!(identity = %self.ctx.identity(), "I/O task stopped.");
    }

    /// Encode and write one packet. An encode error fails only this
    /// packet; a transport error fails the connection.
    async fn write(&mut self, packet: Packet) -> Result<()> {
        let frames = self.pipeline.encode(packet)?;
        for frame in frames {
            trace!(identity = %self.ctx.identity(), frame = %hex::encode(&frame), "TX");
            if let Err(e) = self.link.writer.send(frame).await {
                self.ctx.fail(&Error::Io(e));
                return Err(Error::ConnectionClosed(self.ctx.identity().to_string()));
            }
        }
        Ok(())
    }

    async fn handle_chunk(&mut self, chunk: Bytes) {
        trace!(identity = %self.ctx.identity(), chunk = %hex::encode(&chunk), "RX");
        let decoded = self.pipeline.decode(chunk);
        for e in decoded.errors {
            debug!(identity = %self.ctx.identity(), error = %e, "Inbound frame rejected.");
        }
        for packet in decoded.packets {
            self.dispatch(packet).await;
        }
    }

    async fn dispatch(&mut self, packet: Packet) {
        if packet.internal {
            self.dispatch_internal(packet).await;
            return;
        }

        if packet.ack && packet.ack_num != 0 {
            let mut reply = Packet::raw(packet.message_id.clone(), TypeTag::Callback, Bytes::new())
                .as_internal()
                .with_ack();
            reply.ack_num = packet.ack_num;
            if let Err(e) = self.write(reply).await {
                debug!(identity = %self.ctx.identity(), error = %e, "Acknowledgement not sent.");
            }
        }

        if !packet.query {
            self.queries.resolve(&packet);
        }
        self.ctx.deliver(packet);
    }

    async fn dispatch_internal(&mut self, packet: Packet) {
        if packet.ack {
            self.deliverability.acknowledge(packet.ack_num);
            return;
        }
        if packet.message_id.as_str() != internal::HEARTBEAT {
            trace!(message_id = %packet.message_id, "Ignoring internal packet.");
            return;
        }
        if packet.query {
            // The device probing us; echo the counter.
            let mut echo = packet;
            echo.query = false;
            if let Err(e) = self.write(echo).await {
                debug!(identity = %self.ctx.identity(), error = %e, "Heartbeat echo not sent.");
            }
            return;
        }
        match packet.as_value().and_then(Value::as_u64) {
            Some(counter) => self.ctx.heartbeat_echo(counter as u8),
            None => debug!(identity = %self.ctx.identity(), "Heartbeat echo without counter."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::hint::ConnectionId;
    use crate::pipeline::{BinaryStage, FramingStage, PipelineBuilder};
    use crate::type_cache::TypeCache;
    use std::io;
    use std::time::Duration;
    use tokio_util::codec::{BytesCodec, FramedWrite};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let (ctx, outbound) = ConnectionContext::new(
            ConnectionId::from("loopback:endpoint=gone"),
            TypeCache::new(),
            CancellationToken::new(),
        );
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let link = TransportLink {
            reader: futures::stream::pending::<io::Result<Bytes>>().boxed(),
            writer: Box::pin(FramedWrite::new(near, BytesCodec::new())),
        };
        let pipeline = PipelineBuilder::new()
            .stage(FramingStage::new(1024))
            .stage(BinaryStage)
            .finalize()
            .unwrap();
        let task = IoTask {
            ctx: ctx.clone(),
            pipeline,
            link,
            outbound,
            deliverability: Arc::new(DeliverabilityManager::new(
                ctx.clone(),
                Duration::from_secs(1),
                0,
            )),
            queries: Arc::new(QueryManager::new(ctx.clone())),
        };
        let io_task = tokio::spawn(task.run());

        let result = ctx
            .transmit(Packet::raw("led", TypeTag::Uint8, vec![1]))
            .await;

        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
        io_task.await.unwrap();
        assert_eq!(ctx.state(), ConnectionState::Disconnected);
        assert!(ctx.failure().unwrap().starts_with("I/O error"));
    }
}
