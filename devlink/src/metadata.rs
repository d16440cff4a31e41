//! Metadata reporters.
//!
//! Reporters contribute fields to a connection's metadata when the handshake
//! starts and may run steady-state activity once it is connected. The static
//! reporter advertises transport parameters; the heartbeat reporter
//! advertises its timing and drives liveness probing.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::task::TaskTracker;

use crate::connection::ConnectionContext;
use crate::heartbeat::{self, HeartbeatConfig};

pub trait MetadataReporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fields merged into the connection metadata.
    fn metadata(&self) -> Map<String, Value>;

    /// Called once the connection reaches `Connected`.
    fn on_connected(&self, _ctx: &Arc<ConnectionContext>, _tracker: &TaskTracker) {}
}

/// Fixed transport description.
pub struct StaticReporter {
    fields: Map<String, Value>,
}

impl StaticReporter {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl MetadataReporter for StaticReporter {
    fn name(&self) -> &'static str {
        "static"
    }

    fn metadata(&self) -> Map<String, Value> {
        self.fields.clone()
    }
}

pub struct HeartbeatReporter {
    config: HeartbeatConfig,
}

impl HeartbeatReporter {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }
}

impl MetadataReporter for HeartbeatReporter {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn metadata(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("heartbeatInterval".into(), self.config.interval_ms.into());
        fields.insert("heartbeatTimeout".into(), self.config.timeout_ms.into());
        fields.insert(
            "heartbeatStartupSequence".into(),
            self.config.startup_sequence_ms.clone().into(),
        );
        fields
    }

    fn on_connected(&self, ctx: &Arc<ConnectionContext>, tracker: &TaskTracker) {
        tracker.spawn(heartbeat::run(
            ctx.clone(),
            self.config.clone(),
            ctx.heartbeat_echoes(),
        ));
    }
}
