//! Configuration management for devlink.
//!
//! This module handles loading and validating configuration from TOML files
//! and environment variables. Every section has defaults matching the stock
//! serial and websocket profiles, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;
use crate::protocol::{
    MessageId, TypeTag, CRC_LEN, FRAGMENT_HEADER_LEN, HEADER_LEN, MAX_MESSAGE_ID_LEN, NAME,
};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "DEVLINK_CONFIG";

/// Location used when the environment variable is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/devlink/devlink.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Daemon configuration
    pub daemon: DaemonConfig,

    /// Discovery configuration
    pub discovery: DiscoveryConfig,

    /// Protocol settings shared by every transport
    pub protocol: ProtocolConfig,

    /// Serial transport profile
    pub serial: SerialConfig,

    /// WebSocket transport profile
    pub websockets: NetworkConfig,

    /// Raw TCP transport profile
    pub tcp: NetworkConfig,
}

/// Daemon process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level, overridden by RUST_LOG
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Connect to every matched hint, not only those flagged available
    pub auto_connect: bool,

    /// Enumerate serial ports
    pub serial_enabled: bool,

    /// Serial enumeration period
    pub serial_poll_interval_ms: u64,

    /// Watch USB hotplug events and rescan serial ports on attach
    pub usb_enabled: bool,

    /// Deadline for connection attempts started by discovery
    pub connect_deadline_ms: u64,

    /// Network endpoints to try at startup
    pub manual: Vec<ManualEndpoint>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            serial_enabled: true,
            serial_poll_interval_ms: 1000,
            usb_enabled: true,
            connect_deadline_ms: 10_000,
            manual: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn serial_poll_interval(&self) -> Duration {
        Duration::from_millis(self.serial_poll_interval_ms)
    }

    pub fn connect_deadline(&self) -> Duration {
        Duration::from_millis(self.connect_deadline_ms)
    }
}

/// A network endpoint supplied by hand.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ManualEndpoint {
    /// Transport key, `websockets` or `tcp`
    pub transport: String,

    /// `ws://host:port/path` for websockets, `host:port` for tcp
    pub address: String,
}

/// Protocol settings shared by every transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Identifiers accepted before the type cache knows them
    pub allowed_message_ids: Vec<String>,

    /// Reject inbound packets no codec claims instead of passing them raw
    pub error_if_no_codec_match: bool,

    /// Bound on the identity exchange after the transport opens
    pub handshake_timeout_ms: u64,

    /// Identifiers and types known ahead of time
    pub type_cache: BTreeMap<String, TypeTag>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            allowed_message_ids: vec![NAME.into(), "ws".into()],
            error_if_no_codec_match: true,
            handshake_timeout_ms: 5000,
            type_cache: BTreeMap::new(),
        }
    }
}

impl ProtocolConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn allowed(&self) -> Vec<MessageId> {
        self.allowed_message_ids.iter().map(|s| MessageId::from(s.as_str())).collect()
    }

    pub fn static_types(&self) -> BTreeMap<MessageId, TypeTag> {
        self.type_cache
            .iter()
            .map(|(id, tag)| (MessageId::from(id.as_str()), *tag))
            .collect()
    }
}

/// Link-level parameters of one transport profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LinkConfig {
    /// Payloads longer than this are fragmented
    pub max_payload_length: usize,

    /// Unterminated input longer than this is discarded by the framer
    pub max_frame_length: usize,

    /// Wait for an acknowledgement before resending
    pub deliverability_timeout_ms: u64,

    /// Resends after the first attempt
    pub max_retries: u32,

    /// Liveness probing
    pub heartbeat: HeartbeatConfig,
}

impl LinkConfig {
    /// Stock serial profile.
    pub fn serial() -> Self {
        Self {
            max_payload_length: 100,
            max_frame_length: 1024,
            deliverability_timeout_ms: 3000,
            max_retries: 3,
            heartbeat: HeartbeatConfig::serial(),
        }
    }

    /// Stock websocket and TCP profile.
    pub fn network() -> Self {
        Self {
            heartbeat: HeartbeatConfig::network(),
            ..Self::serial()
        }
    }

    pub fn deliverability_timeout(&self) -> Duration {
        Duration::from_millis(self.deliverability_timeout_ms)
    }

    /// Stuffed length of a full-size fragment with the longest identifier.
    pub fn min_frame_length(&self) -> usize {
        let raw = HEADER_LEN
            + MAX_MESSAGE_ID_LEN
            + FRAGMENT_HEADER_LEN
            + self.max_payload_length
            + CRC_LEN;
        raw + raw.div_ceil(254) + 1
    }

    fn validate(&self, profile: &str) -> Result<()> {
        if self.max_payload_length == 0 {
            return Err(Error::Config(format!("{profile}: max_payload_length must be non-zero")));
        }
        let needed = self.min_frame_length();
        if self.max_frame_length < needed {
            return Err(Error::Config(format!(
                "{profile}: max_frame_length {} cannot hold a full fragment, need {needed}",
                self.max_frame_length
            )));
        }
        if self.deliverability_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "{profile}: deliverability_timeout_ms must be non-zero"
            )));
        }
        self.heartbeat
            .validate()
            .map_err(|e| Error::Config(format!("{profile}: {e}")))
    }
}

/// Serial transport profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate advertised in serial hints
    pub baud_rate: u32,

    /// Port paths containing any of these are never connected
    pub exclude: Vec<String>,

    /// Only connect ports whose USB manufacturer matches this regex
    pub manufacturer: Option<String>,

    /// Delay before first use, for boards that reset when the port opens
    pub attachment_delay_ms: u64,

    /// Link parameters
    pub link: LinkConfig,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            exclude: vec!["Bluetooth".into()],
            manufacturer: None,
            attachment_delay_ms: 0,
            link: LinkConfig::serial(),
        }
    }
}

/// WebSocket or TCP transport profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Link parameters
    pub link: LinkConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::network(),
        }
    }
}

impl Config {
    /// Load configuration from `$DEVLINK_CONFIG`, then the default location,
    /// falling back to built-in defaults when neither exists.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(&PathBuf::from(path));
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load_from(default_path);
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.serial.link.validate("serial")?;
        self.websockets.link.validate("websockets")?;
        self.tcp.link.validate("tcp")?;
        if let Some(pattern) = &self.serial.manufacturer {
            regex::Regex::new(pattern)
                .map_err(|e| Error::Config(format!("serial.manufacturer: {e}")))?;
        }
        if self.discovery.serial_poll_interval_ms == 0 {
            return Err(Error::Config("serial_poll_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}
