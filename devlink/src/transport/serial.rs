use async_trait::async_trait;
use std::time::Duration;
use tokio::time;
use tokio_serial::SerialPortBuilderExt;

use super::{Transport, TransportLink};
use crate::error::Result;
use crate::tracing::prelude::*;

/// Serial port transport.
pub struct SerialTransport {
    com_path: String,
    baud_rate: u32,
    attachment_delay: Duration,
}

impl SerialTransport {
    pub fn new(com_path: String, baud_rate: u32, attachment_delay: Duration) -> Self {
        Self {
            com_path,
            baud_rate,
            attachment_delay,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn open(&mut self) -> Result<TransportLink> {
        let port = tokio_serial::new(&self.com_path, self.baud_rate).open_native_async()?;
        debug!(port = %self.com_path, baud = self.baud_rate, "Serial port opened.");

        // Some boards reset when DTR toggles on open.
        if !self.attachment_delay.is_zero() {
            trace!(delay_ms = self.attachment_delay.as_millis() as u64, "Waiting for board to settle.");
            time::sleep(self.attachment_delay).await;
        }

        Ok(TransportLink::from_io(port))
    }
}
