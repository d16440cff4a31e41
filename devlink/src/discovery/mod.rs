//! Hint producers.
//!
//! Each producer watches one medium and emits [`DiscoveryEvent`]s on a
//! shared channel. Producers are independent background tasks; they only
//! report what they see and never connect to anything themselves.

pub mod manual;
pub mod serial;
pub mod usb;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::Result;
use crate::hint::{ConnectionId, Hint};
use crate::tracing::prelude::*;

pub use manual::{ManualHandle, ManualProducer};
pub use serial::SerialProducer;
pub use usb::UsbProducer;

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Something appeared, or was seen again by a rescan.
    Found(Hint),
    /// A previously reported endpoint went away.
    Gone(ConnectionId),
}

#[async_trait]
pub trait HintProducer: Send {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` is cancelled or the event channel closes.
    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Spawn every producer on `tracker`. A producer that fails is logged and
/// does not affect the others.
pub fn spawn_producers(
    producers: Vec<Box<dyn HintProducer>>,
    events: mpsc::Sender<DiscoveryEvent>,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) {
    for producer in producers {
        let name = producer.name();
        let events = events.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            debug!(producer = name, "Hint producer started.");
            match producer.run(events, shutdown).await {
                Ok(()) => debug!(producer = name, "Hint producer stopped."),
                Err(e) => error!(producer = name, error = %e, "Hint producer failed."),
            }
        });
    }
}
