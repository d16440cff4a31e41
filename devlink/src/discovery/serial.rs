use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, MissedTickBehavior};
use tokio_serial::{SerialPortInfo, SerialPortType};
use tokio_util::sync::CancellationToken;

use super::{DiscoveryEvent, HintProducer};
use crate::error::{Error, Result};
use crate::hint::{ConnectionId, Hint, SERIAL_TRANSPORT_KEY};
use crate::tracing::prelude::*;

/// Polls the operating system's serial port list.
///
/// New ports produce `Found`, vanished ports `Gone`. A notification on the
/// rescan handle triggers an immediate scan; the USB producer uses it so
/// serial hints follow hotplug without waiting for the next poll.
pub struct SerialProducer {
    interval: Duration,
    baud_rate: u32,
    rescan: Arc<Notify>,
}

impl SerialProducer {
    pub fn new(interval: Duration, baud_rate: u32) -> Self {
        Self {
            interval,
            baud_rate,
            rescan: Arc::new(Notify::new()),
        }
    }

    pub fn rescan_handle(&self) -> Arc<Notify> {
        self.rescan.clone()
    }
}

#[async_trait]
impl HintProducer for SerialProducer {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut known: HashMap<ConnectionId, Hint> = HashMap::new();
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.rescan.notified() => trace!("Serial rescan requested."),
            }

            let ports = tokio::task::spawn_blocking(tokio_serial::available_ports)
                .await
                .map_err(|e| Error::Other(format!("serial enumeration panicked: {e}")))?;
            let ports = match ports {
                Ok(ports) => ports,
                Err(e) => {
                    warn!(error = %e, "Serial enumeration failed.");
                    continue;
                }
            };

            let current = ports_to_hints(&ports, self.baud_rate);
            for event in diff(&mut known, current) {
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn ports_to_hints(ports: &[SerialPortInfo], baud_rate: u32) -> Vec<Hint> {
    ports
        .iter()
        .map(|port| {
            let mut hint = Hint::new(SERIAL_TRANSPORT_KEY)
                .with_identification("comPath", port.port_name.as_str())
                .with_configuration("baudRate", baud_rate)
                .available();
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                hint = hint
                    .with_configuration("vendorId", usb.vid)
                    .with_configuration("productId", usb.pid);
                if let Some(m) = &usb.manufacturer {
                    hint = hint.with_configuration("manufacturer", m.as_str());
                }
                if let Some(p) = &usb.product {
                    hint = hint.with_configuration("product", p.as_str());
                }
                if let Some(s) = &usb.serial_number {
                    hint = hint.with_configuration("serialNumber", s.as_str());
                }
            }
            hint
        })
        .collect()
}

/// Update `known` to `current`, returning what changed.
pub(crate) fn diff(known: &mut HashMap<ConnectionId, Hint>, current: Vec<Hint>) -> Vec<DiscoveryEvent> {
    let mut events = Vec::new();
    let mut seen: HashMap<ConnectionId, Hint> = current.into_iter().map(|h| (h.identity(), h)).collect();

    let mut gone: Vec<ConnectionId> = known
        .keys()
        .filter(|id| !seen.contains_key(*id))
        .cloned()
        .collect();
    gone.sort();
    for id in gone {
        debug!(identity = %id, "Serial port gone.");
        known.remove(&id);
        events.push(DiscoveryEvent::Gone(id));
    }

    let mut ids: Vec<ConnectionId> = seen.keys().cloned().collect();
    ids.sort();
    for id in ids {
        let Some(hint) = seen.remove(&id) else { continue };
        if known.get(&id) != Some(&hint) {
            debug!(identity = %id, "Serial port found.");
            events.push(DiscoveryEvent::Found(hint.clone()));
            known.insert(id, hint);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::Unknown,
        }
    }

    #[test]
    fn test_ports_become_available_hints() {
        let hints = ports_to_hints(&[port("/dev/ttyUSB0")], 115_200);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].is_available());
        assert_eq!(hints[0].identification_str("comPath"), Some("/dev/ttyUSB0"));
        assert_eq!(hints[0].configuration_u64("baudRate"), Some(115_200));
    }

    #[test]
    fn test_diff_reports_changes_only() {
        let mut known = HashMap::new();

        let first = diff(&mut known, ports_to_hints(&[port("/dev/ttyUSB0")], 115_200));
        assert!(matches!(&first[..], [DiscoveryEvent::Found(_)]));

        let again = diff(&mut known, ports_to_hints(&[port("/dev/ttyUSB0")], 115_200));
        assert!(again.is_empty());

        let swapped = diff(&mut known, ports_to_hints(&[port("/dev/ttyACM0")], 115_200));
        assert_eq!(swapped.len(), 2);
        assert_eq!(
            swapped[0],
            DiscoveryEvent::Gone(ConnectionId::from("serial:comPath=/dev/ttyUSB0"))
        );
        assert!(matches!(&swapped[1], DiscoveryEvent::Found(h) if h.identification_str("comPath") == Some("/dev/ttyACM0")));
    }
}
