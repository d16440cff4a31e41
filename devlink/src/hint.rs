//! Discovery hints.
//!
//! A hint is a transport-tagged description of something that might be a
//! device. Producers emit them; consumers decide whether to connect. Hints
//! are immutable once built and are superseded by the next scan rather than
//! updated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const SERIAL_TRANSPORT_KEY: &str = "serial";
pub const USB_TRANSPORT_KEY: &str = "usb";
pub const WEBSOCKETS_TRANSPORT_KEY: &str = "websockets";
pub const TCP_TRANSPORT_KEY: &str = "tcp";
pub const LOOPBACK_TRANSPORT_KEY: &str = "loopback";

/// Identity of a (possible) connection, derived from hint identification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A discovered candidate endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    transport_key: String,
    identification: Map<String, Value>,
    configuration: Map<String, Value>,
    available: bool,
}

impl Hint {
    pub fn new(transport_key: impl Into<String>) -> Self {
        Self {
            transport_key: transport_key.into(),
            identification: Map::new(),
            configuration: Map::new(),
            available: false,
        }
    }

    /// Add an identification field, e.g. `comPath` or `uri`.
    pub fn with_identification(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.identification.insert(key.to_string(), value.into());
        self
    }

    /// Add a tunable parameter, e.g. `baudRate`.
    pub fn with_configuration(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.configuration.insert(key.to_string(), value.into());
        self
    }

    /// Mark the endpoint as known to be reachable now.
    pub fn available(mut self) -> Self {
        self.available = true;
        self
    }

    pub fn transport_key(&self) -> &str {
        &self.transport_key
    }

    pub fn identification(&self) -> &Map<String, Value> {
        &self.identification
    }

    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn identification_str(&self, key: &str) -> Option<&str> {
        self.identification.get(key).and_then(Value::as_str)
    }

    pub fn configuration_u64(&self, key: &str) -> Option<u64> {
        self.configuration.get(key).and_then(Value::as_u64)
    }

    /// Stable identity: the transport key plus identification fields in key
    /// order.
    pub fn identity(&self) -> ConnectionId {
        let mut keys: Vec<&String> = self.identification.keys().collect();
        keys.sort();
        let fields: Vec<String> = keys
            .into_iter()
            .map(|k| match &self.identification[k] {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect();
        ConnectionId(format!("{}:{}", self.transport_key, fields.join(",")))
    }
}
