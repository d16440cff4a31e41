//! USB hotplug producer.
//!
//! Watches the USB bus and reports devices as `usb` hints. Most USB devices
//! that speak the protocol do so through a serial interface, so each attach
//! or detach also pokes the serial producer to rescan immediately; the
//! resulting serial hint is what actually gets connected.
//!
//! Platform code implements [`UsbDiscoveryImpl`], a blocking monitor run on
//! a dedicated thread.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::{DiscoveryEvent, HintProducer};
use crate::error::{Error, Result};
use crate::hint::{ConnectionId, Hint, USB_TRANSPORT_KEY};
use crate::tracing::prelude::*;

/// What the platform monitor knows about one USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Platform path, stable for as long as the device stays attached.
    pub syspath: String,
}

impl UsbDeviceInfo {
    pub fn to_hint(&self) -> Hint {
        let mut hint = Hint::new(USB_TRANSPORT_KEY)
            .with_identification("vendorId", self.vid)
            .with_identification("productId", self.pid);
        hint = match &self.serial_number {
            Some(serial) => hint.with_identification("serialNumber", serial.as_str()),
            None => hint.with_identification("syspath", self.syspath.as_str()),
        };
        if let Some(m) = &self.manufacturer {
            hint = hint.with_configuration("manufacturer", m.as_str());
        }
        if let Some(p) = &self.product {
            hint = hint.with_configuration("product", p.as_str());
        }
        hint
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    Attached(UsbDeviceInfo),
    Detached { syspath: String },
}

/// Blocking platform monitor. Reports devices already present, then
/// hotplug events, until `shutdown` is cancelled or `event_tx` closes.
pub trait UsbDiscoveryImpl: Send {
    fn monitor_blocking(
        self: Box<Self>,
        event_tx: mpsc::Sender<UsbEvent>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

fn platform_discovery() -> Result<Box<dyn UsbDiscoveryImpl>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxUdevDiscovery::new()?))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::MacOsIoKitDiscovery::new()?))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(Error::Other("USB discovery is not supported on this platform".into()))
    }
}

pub struct UsbProducer {
    serial_rescan: Option<Arc<Notify>>,
}

impl UsbProducer {
    pub fn new() -> Self {
        Self { serial_rescan: None }
    }

    /// Trigger a serial rescan on every attach and detach.
    pub fn with_serial_rescan(mut self, rescan: Arc<Notify>) -> Self {
        self.serial_rescan = Some(rescan);
        self
    }
}

impl Default for UsbProducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks attached devices so detach events, which carry only the
/// platform path, can be turned into `Gone` for the right identity.
#[derive(Default)]
pub(crate) struct UsbTracker {
    attached: HashMap<String, ConnectionId>,
}

impl UsbTracker {
    pub(crate) fn apply(&mut self, event: UsbEvent) -> Option<DiscoveryEvent> {
        match event {
            UsbEvent::Attached(info) => {
                let hint = info.to_hint();
                debug!(
                    vid = %format!("{:04x}", info.vid),
                    pid = %format!("{:04x}", info.pid),
                    manufacturer = ?info.manufacturer,
                    product = ?info.product,
                    "USB device attached."
                );
                self.attached.insert(info.syspath, hint.identity());
                Some(DiscoveryEvent::Found(hint))
            }
            UsbEvent::Detached { syspath } => {
                let identity = self.attached.remove(&syspath)?;
                debug!(identity = %identity, "USB device detached.");
                Some(DiscoveryEvent::Gone(identity))
            }
        }
    }
}

#[async_trait]
impl HintProducer for UsbProducer {
    fn name(&self) -> &'static str {
        "usb"
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let monitor = platform_discovery()?;
        let (usb_tx, mut usb_rx) = mpsc::channel(32);
        let monitor_shutdown = shutdown.clone();
        let monitor_task =
            tokio::task::spawn_blocking(move || monitor.monitor_blocking(usb_tx, monitor_shutdown));

        let mut tracker = UsbTracker::default();
        loop {
            let usb_event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = usb_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(event) = tracker.apply(usb_event) else {
                continue;
            };
            if let Some(rescan) = &self.serial_rescan {
                rescan.notify_one();
            }
            if events.send(event).await.is_err() {
                break;
            }
        }
        drop(usb_rx);

        monitor_task
            .await
            .map_err(|e| Error::Other(format!("USB monitor panicked: {e}")))?
    }
}
