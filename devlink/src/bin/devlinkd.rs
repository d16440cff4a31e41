use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use devlink::config::Config;
use devlink::discovery::{self, HintProducer, ManualProducer, SerialProducer, UsbProducer};
use devlink::registry::{Blueprint, ConnectionRegistry, RegistryEvent};
use devlink::tracing::{self, prelude::*};

const DISCOVERY_DEPTH: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    if std::env::var("JOURNAL_STREAM").is_ok() {
        tracing::init_journald_or_stdout();
    } else {
        tracing::init_stdout_with_level(&config.daemon.log_level);
    }

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let blueprint = Blueprint::from_config(&config, None).context("building blueprint")?;
    let registry = ConnectionRegistry::with_shutdown(blueprint, running.child_token());

    let mut producers: Vec<Box<dyn HintProducer>> = Vec::new();
    let serial = SerialProducer::new(config.discovery.serial_poll_interval(), config.serial.baud_rate);
    let rescan = serial.rescan_handle();
    if config.discovery.serial_enabled {
        producers.push(Box::new(serial));
    }
    if config.discovery.usb_enabled {
        let usb = UsbProducer::new();
        let usb = if config.discovery.serial_enabled {
            usb.with_serial_rescan(rescan)
        } else {
            usb
        };
        producers.push(Box::new(usb));
    }
    let (manual, _manual_handle) = ManualProducer::new(&config.discovery.manual)?;
    producers.push(Box::new(manual));

    let (events_tx, events_rx) = mpsc::channel(DISCOVERY_DEPTH);
    discovery::spawn_producers(producers, events_tx, running.clone(), &tracker);

    tracker.spawn({
        let registry = registry.clone();
        async move { registry.run_discovery(events_rx).await }
    });
    tracker.spawn(log_events(registry.subscribe(), running.clone()));
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    registry.shutdown().await;

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}

async fn log_events(
    events: tokio::sync::broadcast::Receiver<RegistryEvent>,
    running: CancellationToken,
) {
    let mut events = BroadcastStream::new(events);
    loop {
        let event = tokio::select! {
            _ = running.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(error = %e, "Registry events dropped.");
                    continue;
                }
                None => break,
            },
        };
        match event {
            RegistryEvent::Connected { identity, handle } => {
                info!(identity = %identity, metadata = %serde_json::Value::Object(handle.metadata()), "Device connected.");
            }
            RegistryEvent::Failed { identity, error } => {
                warn!(identity = %identity, error = %error, "Device connection failed.");
            }
            RegistryEvent::Closed { identity, reason } => {
                info!(identity = %identity, reason = ?reason, "Device disconnected.");
            }
            RegistryEvent::StateChanged { identity, state } => {
                debug!(identity = %identity, state = %state, "State changed.");
            }
            RegistryEvent::Connecting { .. } => {}
        }
    }
}
