//! Heartbeat liveness probing.
//!
//! The host sends an internal `h` query carrying a rolling counter; the
//! device echoes the counter back. Pings follow the startup sequence first
//! (offsets from the moment the connection is established), then repeat on
//! the steady interval regardless of other traffic.
//!
//! [`HeartbeatMonitor`] is the pure state machine and never touches a clock
//! by itself: every call takes the current instant, so tests can drive it
//! with paused tokio time. [`run`] is the task wrapping it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::connection::{ConnectionContext, ConnectionState};
use crate::error::Error;
use crate::protocol::{internal, Packet, TypeTag};
use crate::tracing::prelude::*;

/// Pings kept around for late echoes.
const MAX_OUTSTANDING: usize = 16;

/// Heartbeat timing for one transport profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    /// Steady-state period between pings
    pub interval_ms: u64,

    /// A ping unanswered for this long marks the link degraded
    pub timeout_ms: u64,

    /// Ping offsets from connection start, before the steady interval
    pub startup_sequence_ms: Vec<u64>,

    /// Time spent degraded before the link is declared lost
    pub grace_ms: u64,
}

impl HeartbeatConfig {
    pub fn serial() -> Self {
        Self {
            interval_ms: 500,
            timeout_ms: 1000,
            startup_sequence_ms: vec![0, 2000, 2500, 3000, 4000, 5000],
            grace_ms: 5000,
        }
    }

    pub fn network() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 3000,
            startup_sequence_ms: vec![0, 2000, 5000],
            grace_ms: 10_000,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            return Err("heartbeat interval and timeout must be non-zero".into());
        }
        if self.startup_sequence_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err("heartbeat startup sequence must be ascending".into());
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::serial()
    }
}

/// State changes reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A ping went unanswered past the timeout.
    Missed { counter: u8 },
    /// An echo arrived while degraded.
    Recovered { rtt: Duration },
    /// Degraded for longer than the grace period.
    Lost,
}

#[derive(Debug, Clone, Copy)]
struct Ping {
    counter: u8,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    started: Instant,
    pings_sent: usize,
    next_send: Instant,
    counter: u8,
    outstanding: VecDeque<Ping>,
    degraded_since: Option<Instant>,
    lost: bool,
    last_rtt: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        let first = config
            .startup_sequence_ms
            .first()
            .map_or(config.interval(), |ms| Duration::from_millis(*ms));
        Self {
            next_send: now + first,
            config,
            started: now,
            pings_sent: 0,
            counter: 0,
            outstanding: VecDeque::new(),
            degraded_since: None,
            lost: false,
            last_rtt: None,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn next_send_at(&self) -> Instant {
        self.next_send
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_since.is_some()
    }

    /// Round-trip time of the last echo that arrived within the timeout.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Record that a ping is going out now and return its counter.
    pub fn record_sent(&mut self, now: Instant) -> u8 {
        self.counter = self.counter.wrapping_add(1);
        self.outstanding.push_back(Ping {
            counter: self.counter,
            sent_at: now,
        });
        while self.outstanding.len() > MAX_OUTSTANDING {
            self.outstanding.pop_front();
        }

        self.pings_sent += 1;
        let startup = &self.config.startup_sequence_ms;
        self.next_send = match startup.get(self.pings_sent) {
            Some(offset) => self.started + Duration::from_millis(*offset),
            None => now + self.config.interval(),
        };
        self.counter
    }

    /// Treat the link as degraded from `now` on, if it is not already.
    ///
    /// For degradation decided elsewhere, such as exhausted deliveries: the
    /// next on-time echo then reports recovery and the grace period runs.
    pub fn mark_degraded(&mut self, now: Instant) {
        if !self.lost && self.degraded_since.is_none() {
            self.degraded_since = Some(now);
        }
    }

    /// Record an echo for `counter`. Unknown counters are ignored.
    ///
    /// Only an echo within the timeout recovers a degraded link. A late
    /// echo degrades a healthy one.
    pub fn record_ack(&mut self, counter: u8, now: Instant) -> Option<HeartbeatEvent> {
        let position = self.outstanding.iter().position(|p| p.counter == counter)?;
        let ping = self.outstanding[position];
        // Older pings are answered implicitly.
        self.outstanding.drain(..=position);

        if self.lost {
            return None;
        }
        let rtt = now.saturating_duration_since(ping.sent_at);
        if rtt > self.config.timeout() {
            if self.degraded_since.is_some() {
                return None;
            }
            self.degraded_since = Some(now);
            return Some(HeartbeatEvent::Missed { counter });
        }
        self.last_rtt = Some(rtt);
        self.degraded_since.take().map(|_| HeartbeatEvent::Recovered { rtt })
    }

    /// Check ping deadlines.
    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatEvent> {
        if self.lost {
            return None;
        }
        if let Some(since) = self.degraded_since {
            if now >= since + self.config.grace() {
                self.lost = true;
                return Some(HeartbeatEvent::Lost);
            }
            return None;
        }
        let timeout = self.config.timeout();
        let expired = self
            .outstanding
            .iter()
            .find(|p| now >= p.sent_at + timeout)?;
        let counter = expired.counter;
        self.degraded_since = Some(now);
        Some(HeartbeatEvent::Missed { counter })
    }

    /// Earliest instant at which [`poll`](Self::poll) or a send is due.
    pub fn next_deadline(&self) -> Instant {
        let check = match self.degraded_since {
            Some(since) => Some(since + self.config.grace()),
            None => self
                .outstanding
                .front()
                .map(|p| p.sent_at + self.config.timeout()),
        };
        match check {
            Some(at) if !self.lost => at.min(self.next_send),
            _ => self.next_send,
        }
    }
}

/// Drive heartbeats for one connection until it shuts down.
pub async fn run(
    ctx: Arc<ConnectionContext>,
    config: HeartbeatConfig,
    mut echoes: broadcast::Receiver<u8>,
) {
    let shutdown = ctx.shutdown_token();
    let mut monitor = HeartbeatMonitor::new(config, Instant::now());
    trace!(identity = %ctx.identity(), "Heartbeat started.");

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep_until(monitor.next_deadline()) => {
                let now = Instant::now();
                if now >= monitor.next_send_at() {
                    let counter = monitor.record_sent(now);
                    let ping = Packet::raw(internal::HEARTBEAT, TypeTag::Uint8, vec![counter])
                        .as_internal()
                        .as_query();
                    if let Err(e) = ctx.transmit(ping).await {
                        debug!(identity = %ctx.identity(), error = %e, "Heartbeat not sent.");
                    }
                }
                monitor.poll(Instant::now())
            }
            echo = echoes.recv() => match echo {
                Ok(counter) => {
                    let now = Instant::now();
                    if ctx.state() == ConnectionState::Degraded {
                        monitor.mark_degraded(now);
                    }
                    let event = monitor.record_ack(counter, now);
                    if let Some(rtt) = monitor.last_rtt() {
                        ctx.set_metadata("latency", rtt.as_millis() as u64);
                    }
                    event
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(identity = %ctx.identity(), skipped = n, "Heartbeat echoes lagged.");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match event {
            Some(HeartbeatEvent::Missed { counter }) => {
                warn!(identity = %ctx.identity(), counter, "Heartbeat missed.");
                ctx.transition(ConnectionState::Degraded);
            }
            Some(HeartbeatEvent::Recovered { rtt }) => {
                info!(identity = %ctx.identity(), rtt_ms = rtt.as_millis() as u64, "Heartbeat recovered.");
                ctx.transition(ConnectionState::Connected);
            }
            Some(HeartbeatEvent::Lost) => {
                ctx.fail(&Error::HeartbeatTimeout {
                    identity: ctx.identity().to_string(),
                });
                break;
            }
            None => {}
        }
    }

    trace!(identity = %ctx.identity(), "Heartbeat stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_sequence_then_interval() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::serial(), t0);

        let mut sends = Vec::new();
        for _ in 0..8 {
            let at = monitor.next_send_at();
            sends.push(at - t0);
            let counter = monitor.record_sent(at);
            monitor.record_ack(counter, at + ms(10));
        }

        assert_eq!(
            sends,
            [0, 2000, 2500, 3000, 4000, 5000, 5500, 6000].map(ms)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_degrades_after_timeout() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::serial(), t0);
        let counter = monitor.record_sent(t0);

        assert_eq!(monitor.poll(t0 + ms(999)), None);
        assert_eq!(monitor.next_deadline(), t0 + ms(1000));
        assert_eq!(
            monitor.poll(t0 + ms(1000)),
            Some(HeartbeatEvent::Missed { counter })
        );
        assert!(monitor.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_echoes_still_end_in_lost() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::serial(), t0);

        // Every ping answered 1200 ms after it went out.
        let mut events = Vec::new();
        let mut in_flight: VecDeque<(u8, Instant)> = VecDeque::new();
        let mut now = t0;
        while now < t0 + ms(60_000) && !events.contains(&HeartbeatEvent::Lost) {
            if now >= monitor.next_send_at() {
                in_flight.push_back((monitor.record_sent(now), now + ms(1200)));
            }
            while let Some(&(counter, due)) = in_flight.front() {
                if due > now {
                    break;
                }
                in_flight.pop_front();
                events.extend(monitor.record_ack(counter, now));
            }
            events.extend(monitor.poll(now));
            now += ms(100);
        }

        assert!(events.contains(&HeartbeatEvent::Lost));
        assert!(!events
            .iter()
            .any(|e| matches!(e, HeartbeatEvent::Recovered { .. })));
        assert_eq!(monitor.last_rtt(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_echo_does_not_recover() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::serial(), t0);
        let counter = monitor.record_sent(t0);
        monitor.poll(t0 + ms(1000));

        assert_eq!(monitor.record_ack(counter, t0 + ms(1200)), None);
        assert!(monitor.is_degraded());
        assert_eq!(monitor.last_rtt(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_degradation_recovers_on_time() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::serial(), t0);
        let counter = monitor.record_sent(t0);

        monitor.mark_degraded(t0 + ms(10));
        assert_eq!(
            monitor.record_ack(counter, t0 + ms(20)),
            Some(HeartbeatEvent::Recovered { rtt: ms(20) })
        );
        assert!(!monitor.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_past_grace_is_lost() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::serial(), t0);
        monitor.record_sent(t0);
        monitor.poll(t0 + ms(1000));

        assert_eq!(monitor.poll(t0 + ms(5999)), None);
        assert_eq!(monitor.poll(t0 + ms(6000)), Some(HeartbeatEvent::Lost));
        assert_eq!(monitor.poll(t0 + ms(7000)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_for_newer_ping_clears_older() {
        let t0 = Instant::now();
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig::network(), t0);
        monitor.record_sent(t0);
        let second = monitor.record_sent(t0 + ms(2000));
        monitor.record_ack(second, t0 + ms(2050));

        assert_eq!(monitor.poll(t0 + ms(3500)), None);
        assert_eq!(monitor.last_rtt(), Some(ms(50)));
    }

    #[test]
    fn test_descending_startup_is_invalid() {
        let config = HeartbeatConfig {
            startup_sequence_ms: vec![0, 3000, 2000],
            ..HeartbeatConfig::serial()
        };
        assert!(config.validate().is_err());
    }
}
