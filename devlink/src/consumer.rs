//! Hint consumers.
//!
//! One consumer per transport kind decides whether it can handle a hint and
//! derives transport options from it. Consumers are tried in registration
//! order and the first that accepts wins; a hint is never handed to two.

use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SerialConfig};
use crate::error::{Error, Result};
use crate::factory::{TransportFactory, TransportProfile};
use crate::hint::{
    Hint, LOOPBACK_TRANSPORT_KEY, SERIAL_TRANSPORT_KEY, TCP_TRANSPORT_KEY,
    WEBSOCKETS_TRANSPORT_KEY,
};
use crate::transport::{LoopbackHub, TransportOptions};

pub trait HintConsumer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pure, non-blocking acceptance check.
    fn can_consume(&self, hint: &Hint) -> bool;

    /// Derive transport options. Only called after `can_consume`.
    fn configure(&self, hint: &Hint) -> Result<TransportOptions>;

    fn factory(&self) -> &TransportFactory;
}

/// First consumer, in order, that accepts the hint.
pub fn select<'a>(
    consumers: &'a [Arc<dyn HintConsumer>],
    hint: &Hint,
) -> Option<&'a Arc<dyn HintConsumer>> {
    consumers.iter().find(|c| c.can_consume(hint))
}

/// The stock consumers for every transport enabled in `config`.
pub fn from_config(config: &Config, hub: Option<LoopbackHub>) -> Result<Vec<Arc<dyn HintConsumer>>> {
    let mut consumers: Vec<Arc<dyn HintConsumer>> = vec![
        Arc::new(SerialConsumer::new(
            &config.serial,
            TransportFactory::new(TransportProfile::from_config(config, &config.serial.link)),
        )?),
        Arc::new(WebSocketConsumer::new(TransportFactory::new(
            TransportProfile::from_config(config, &config.websockets.link),
        ))),
        Arc::new(TcpConsumer::new(TransportFactory::new(
            TransportProfile::from_config(config, &config.tcp.link),
        ))),
    ];
    if let Some(hub) = hub {
        consumers.push(Arc::new(LoopbackConsumer::new(
            hub,
            TransportFactory::new(TransportProfile::from_config(config, &config.serial.link)),
        )));
    }
    Ok(consumers)
}

/// Serial ports, minus excluded paths and unwanted manufacturers.
pub struct SerialConsumer {
    exclude: Vec<String>,
    manufacturer: Option<Regex>,
    default_baud_rate: u32,
    attachment_delay: Duration,
    factory: TransportFactory,
}

impl SerialConsumer {
    pub fn new(config: &SerialConfig, factory: TransportFactory) -> Result<Self> {
        let manufacturer = config
            .manufacturer
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("serial.manufacturer: {e}")))?;
        Ok(Self {
            exclude: config.exclude.clone(),
            manufacturer,
            default_baud_rate: config.baud_rate,
            attachment_delay: Duration::from_millis(config.attachment_delay_ms),
            factory,
        })
    }
}

impl HintConsumer for SerialConsumer {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn can_consume(&self, hint: &Hint) -> bool {
        if hint.transport_key() != SERIAL_TRANSPORT_KEY {
            return false;
        }
        let Some(path) = hint.identification_str("comPath") else {
            return false;
        };
        if self.exclude.iter().any(|pattern| path.contains(pattern.as_str())) {
            return false;
        }
        match &self.manufacturer {
            Some(re) => hint
                .configuration()
                .get("manufacturer")
                .and_then(|v| v.as_str())
                .is_some_and(|m| re.is_match(m)),
            None => true,
        }
    }

    fn configure(&self, hint: &Hint) -> Result<TransportOptions> {
        let com_path = hint
            .identification_str("comPath")
            .ok_or_else(|| Error::Other("serial hint without comPath".into()))?;
        let baud_rate = hint
            .configuration_u64("baudRate")
            .and_then(|b| u32::try_from(b).ok())
            .unwrap_or(self.default_baud_rate);
        Ok(TransportOptions::Serial {
            com_path: com_path.to_string(),
            baud_rate,
            attachment_delay: self.attachment_delay,
        })
    }

    fn factory(&self) -> &TransportFactory {
        &self.factory
    }
}

pub struct WebSocketConsumer {
    factory: TransportFactory,
}

impl WebSocketConsumer {
    pub fn new(factory: TransportFactory) -> Self {
        Self { factory }
    }
}

impl HintConsumer for WebSocketConsumer {
    fn name(&self) -> &'static str {
        "websockets"
    }

    fn can_consume(&self, hint: &Hint) -> bool {
        hint.transport_key() == WEBSOCKETS_TRANSPORT_KEY
            && hint
                .identification_str("uri")
                .is_some_and(|uri| uri.starts_with("ws://") || uri.starts_with("wss://"))
    }

    fn configure(&self, hint: &Hint) -> Result<TransportOptions> {
        let uri = hint
            .identification_str("uri")
            .ok_or_else(|| Error::Other("websocket hint without uri".into()))?;
        Ok(TransportOptions::WebSocket {
            uri: uri.to_string(),
        })
    }

    fn factory(&self) -> &TransportFactory {
        &self.factory
    }
}

pub struct TcpConsumer {
    factory: TransportFactory,
}

impl TcpConsumer {
    pub fn new(factory: TransportFactory) -> Self {
        Self { factory }
    }
}

impl HintConsumer for TcpConsumer {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_consume(&self, hint: &Hint) -> bool {
        hint.transport_key() == TCP_TRANSPORT_KEY && hint.identification_str("addr").is_some()
    }

    fn configure(&self, hint: &Hint) -> Result<TransportOptions> {
        let addr = hint
            .identification_str("addr")
            .ok_or_else(|| Error::Other("tcp hint without addr".into()))?;
        Ok(TransportOptions::Tcp {
            addr: addr.to_string(),
        })
    }

    fn factory(&self) -> &TransportFactory {
        &self.factory
    }
}

/// Virtual devices listening on a loopback hub.
pub struct LoopbackConsumer {
    hub: LoopbackHub,
    factory: TransportFactory,
}

impl LoopbackConsumer {
    pub fn new(hub: LoopbackHub, factory: TransportFactory) -> Self {
        Self { hub, factory }
    }
}

impl HintConsumer for LoopbackConsumer {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn can_consume(&self, hint: &Hint) -> bool {
        hint.transport_key() == LOOPBACK_TRANSPORT_KEY
            && hint.identification_str("endpoint").is_some()
    }

    fn configure(&self, hint: &Hint) -> Result<TransportOptions> {
        let endpoint = hint
            .identification_str("endpoint")
            .ok_or_else(|| Error::Other("loopback hint without endpoint".into()))?;
        Ok(TransportOptions::Loopback {
            endpoint: endpoint.to_string(),
            hub: self.hub.clone(),
        })
    }

    fn factory(&self) -> &TransportFactory {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn serial_consumer(config: &SerialConfig) -> SerialConsumer {
        let full = Config::default();
        SerialConsumer::new(
            config,
            TransportFactory::new(TransportProfile::from_config(&full, &config.link)),
        )
        .unwrap()
    }

    fn serial_hint(path: &str) -> Hint {
        Hint::new(SERIAL_TRANSPORT_KEY)
            .with_identification("comPath", path)
            .with_configuration("baudRate", 115_200)
    }

    #[test]
    fn test_serial_accepts_usb_tty() {
        let consumer = serial_consumer(&SerialConfig::default());
        let hint = serial_hint("/dev/ttyUSB0");
        assert!(consumer.can_consume(&hint));

        let TransportOptions::Serial {
            com_path, baud_rate, ..
        } = consumer.configure(&hint).unwrap()
        else {
            panic!("expected serial options");
        };
        assert_eq!(com_path, "/dev/ttyUSB0");
        assert_eq!(baud_rate, 115_200);
    }

    #[test]
    fn test_serial_rejects_bluetooth() {
        let consumer = serial_consumer(&SerialConfig::default());
        assert!(!consumer.can_consume(&serial_hint("/dev/tty.Bluetooth-Incoming-Port")));
    }

    #[test]
    fn test_serial_manufacturer_filter() {
        let config = SerialConfig {
            manufacturer: Some("^(Arduino|Silicon Labs)".into()),
            ..SerialConfig::default()
        };
        let consumer = serial_consumer(&config);

        let matching = serial_hint("/dev/ttyACM0").with_configuration("manufacturer", "Arduino LLC");
        let other = serial_hint("/dev/ttyACM1").with_configuration("manufacturer", "FTDI");
        let unknown = serial_hint("/dev/ttyS0");

        assert!(consumer.can_consume(&matching));
        assert!(!consumer.can_consume(&other));
        assert!(!consumer.can_consume(&unknown));
    }

    #[test]
    fn test_transport_keys_do_not_cross() {
        let config = Config::default();
        let consumers = from_config(&config, None).unwrap();
        let ws = Hint::new(WEBSOCKETS_TRANSPORT_KEY).with_identification("uri", "ws://10.0.0.2/ws");

        assert_eq!(select(&consumers, &ws).unwrap().name(), "websockets");
        assert!(select(&consumers, &Hint::new("bluetooth-le")).is_none());
    }

    /// Accepts everything and counts how often it was asked.
    struct Greedy {
        name: &'static str,
        asked: AtomicUsize,
        factory: TransportFactory,
    }

    impl HintConsumer for Greedy {
        fn name(&self) -> &'static str {
            self.name
        }

        fn can_consume(&self, _hint: &Hint) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn configure(&self, _hint: &Hint) -> Result<TransportOptions> {
            Ok(TransportOptions::Tcp {
                addr: "127.0.0.1:1".into(),
            })
        }

        fn factory(&self) -> &TransportFactory {
            &self.factory
        }
    }

    #[test]
    fn test_first_accepting_consumer_wins() {
        let config = Config::default();
        let factory = TransportFactory::new(TransportProfile::from_config(&config, &config.tcp.link));
        let first = Arc::new(Greedy {
            name: "first",
            asked: AtomicUsize::new(0),
            factory: factory.clone(),
        });
        let second = Arc::new(Greedy {
            name: "second",
            asked: AtomicUsize::new(0),
            factory,
        });
        let consumers: Vec<Arc<dyn HintConsumer>> = vec![first.clone(), second.clone()];

        let chosen = select(&consumers, &serial_hint("/dev/ttyUSB0")).unwrap();

        assert_eq!(chosen.name(), "first");
        assert_eq!(first.asked.load(Ordering::SeqCst), 1);
        assert_eq!(second.asked.load(Ordering::SeqCst), 0);
    }
}
