//! macOS USB discovery stub.
//!
//! Serial ports are still found by polling on macOS; only hotplug-driven
//! rescans are missing until an IOKit monitor lands here.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{UsbDiscoveryImpl, UsbEvent};
use crate::error::{Error, Result};

pub struct MacOsIoKitDiscovery;

impl MacOsIoKitDiscovery {
    pub fn new() -> Result<Self> {
        Err(Error::Other(
            "USB discovery is not yet implemented for macOS".to_string(),
        ))
    }
}

impl UsbDiscoveryImpl for MacOsIoKitDiscovery {
    fn monitor_blocking(
        self: Box<Self>,
        _event_tx: mpsc::Sender<UsbEvent>,
        _shutdown: CancellationToken,
    ) -> Result<()> {
        Err(Error::Other(
            "USB discovery is not yet implemented for macOS".to_string(),
        ))
    }
}
