use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Transport, TransportLink};
use crate::error::Result;
use crate::tracing::prelude::*;

/// Raw TCP socket transport.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn open(&mut self) -> Result<TransportLink> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "TCP connection established.");
        Ok(TransportLink::from_io(stream))
    }
}
