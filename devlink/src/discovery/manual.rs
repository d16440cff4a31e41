use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DiscoveryEvent, HintProducer};
use crate::config::ManualEndpoint;
use crate::error::{Error, Result};
use crate::hint::{Hint, TCP_TRANSPORT_KEY, WEBSOCKETS_TRANSPORT_KEY};
use crate::tracing::prelude::*;

/// Hints for network addresses supplied by hand, either in configuration
/// or at runtime through a [`ManualHandle`].
pub struct ManualProducer {
    initial: Vec<Hint>,
    added: mpsc::Receiver<Hint>,
}

/// Runtime entry point for manually supplied endpoints.
#[derive(Debug, Clone)]
pub struct ManualHandle {
    tx: mpsc::Sender<Hint>,
}

impl ManualHandle {
    pub async fn add(&self, hint: Hint) -> Result<()> {
        self.tx
            .send(hint)
            .await
            .map_err(|_| Error::Other("manual hint producer stopped".into()))
    }
}

impl ManualProducer {
    pub fn new(endpoints: &[ManualEndpoint]) -> Result<(Self, ManualHandle)> {
        let initial = endpoints.iter().map(endpoint_hint).collect::<Result<Vec<_>>>()?;
        let (tx, added) = mpsc::channel(16);
        Ok((Self { initial, added }, ManualHandle { tx }))
    }
}

/// Hint for a configured endpoint. Manual hints are marked available: the
/// user asked for them explicitly.
pub fn endpoint_hint(endpoint: &ManualEndpoint) -> Result<Hint> {
    let key = match endpoint.transport.as_str() {
        WEBSOCKETS_TRANSPORT_KEY => "uri",
        TCP_TRANSPORT_KEY => "addr",
        other => {
            return Err(Error::Config(format!(
                "manual endpoint transport '{other}' is not a network transport"
            )))
        }
    };
    Ok(Hint::new(endpoint.transport.as_str())
        .with_identification(key, endpoint.address.as_str())
        .available())
}

#[async_trait]
impl HintProducer for ManualProducer {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let ManualProducer { initial, mut added } = *self;
        for hint in initial {
            trace!(identity = %hint.identity(), "Manual endpoint.");
            if events.send(DiscoveryEvent::Found(hint)).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                hint = added.recv() => {
                    let Some(hint) = hint else { break };
                    if events.send(DiscoveryEvent::Found(hint)).await.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
