//! udev-based USB monitor.

use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{UsbDeviceInfo, UsbDiscoveryImpl, UsbEvent};
use crate::error::Result;
use crate::tracing::prelude::*;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct LinuxUdevDiscovery;

impl LinuxUdevDiscovery {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl UsbDiscoveryImpl for LinuxUdevDiscovery {
    fn monitor_blocking(
        self: Box<Self>,
        event_tx: mpsc::Sender<UsbEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        // Listen before enumerating so a device plugged in between the two
        // is not missed.
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem_devtype("usb", "usb_device")?
            .listen()?;

        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("usb")?;
        enumerator.match_property("DEVTYPE", "usb_device")?;
        for device in enumerator.scan_devices()? {
            if let Some(info) = device_info(&device) {
                if event_tx.blocking_send(UsbEvent::Attached(info)).is_err() {
                    return Ok(());
                }
            }
        }

        while !shutdown.is_cancelled() {
            for event in socket.iter() {
                let device = event.device();
                let message = match event.event_type() {
                    udev::EventType::Add => device_info(&device).map(UsbEvent::Attached),
                    udev::EventType::Remove => Some(UsbEvent::Detached {
                        syspath: device.syspath().to_string_lossy().into_owned(),
                    }),
                    _ => None,
                };
                if let Some(message) = message {
                    if event_tx.blocking_send(message).is_err() {
                        return Ok(());
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        }

        trace!("udev monitor stopped.");
        Ok(())
    }
}

fn device_info(device: &udev::Device) -> Option<UsbDeviceInfo> {
    Some(UsbDeviceInfo {
        vid: hex_attribute(device, "idVendor")?,
        pid: hex_attribute(device, "idProduct")?,
        manufacturer: attribute(device, "manufacturer"),
        product: attribute(device, "product"),
        serial_number: attribute(device, "serial"),
        syspath: device.syspath().to_string_lossy().into_owned(),
    })
}

fn attribute(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .map(|v| v.to_string_lossy().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn hex_attribute(device: &udev::Device, name: &str) -> Option<u16> {
    u16::from_str_radix(&attribute(device, name)?, 16).ok()
}
