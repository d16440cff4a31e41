//! Acknowledged delivery with bounded retries.
//!
//! A packet flagged for acknowledgement gets an ack number from a rolling
//! 1..=255 space and is resent until the device answers with an internal ack
//! packet carrying the same number, or the retries run out. Exhaustion fails
//! the send and marks the connection degraded. Packets without the flag are
//! written once and not tracked.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

use crate::connection::{ConnectionContext, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::tracing::prelude::*;

struct Waiter {
    key: u64,
    acked: oneshot::Sender<()>,
}

struct Pending {
    next_ack: u8,
    next_key: u64,
    waiters: HashMap<u8, Waiter>,
}

/// Holds an ack number for one send and frees it when dropped, including
/// when the caller abandons the send midway.
struct AckSlot<'a> {
    manager: &'a DeliverabilityManager,
    ack_num: u8,
    key: u64,
}

impl AckSlot<'_> {
    /// Free the number now. Returns false if an ack already took it.
    fn release(&self) -> bool {
        let mut pending = self.manager.pending.lock();
        match pending.waiters.get(&self.ack_num) {
            Some(waiter) if waiter.key == self.key => {
                pending.waiters.remove(&self.ack_num);
                true
            }
            _ => false,
        }
    }
}

impl Drop for AckSlot<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct DeliverabilityManager {
    ctx: Arc<ConnectionContext>,
    timeout: Duration,
    max_retries: u32,
    pending: Mutex<Pending>,
}

impl DeliverabilityManager {
    pub fn new(ctx: Arc<ConnectionContext>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            ctx,
            timeout,
            max_retries,
            pending: Mutex::new(Pending {
                next_ack: 0,
                next_key: 0,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Total transmissions of an acknowledged packet before giving up.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub async fn send(&self, mut packet: Packet) -> Result<()> {
        if !packet.ack {
            return self.ctx.transmit(packet).await;
        }

        let (slot, mut acked) = self.register()?;
        let ack_num = slot.ack_num;
        packet.ack_num = ack_num;

        for attempt in 1..=self.attempts() {
            self.ctx.transmit(packet.clone()).await?;
            match time::timeout(self.timeout, &mut acked).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => {
                    return Err(Error::ConnectionClosed(self.ctx.identity().to_string()));
                }
                Err(_) => {
                    debug!(
                        identity = %self.ctx.identity(),
                        message_id = %packet.message_id,
                        ack_num,
                        attempt,
                        "No acknowledgement."
                    );
                }
            }
        }

        let late = !slot.release();
        if late && acked.try_recv().is_ok() {
            return Ok(());
        }

        warn!(
            identity = %self.ctx.identity(),
            message_id = %packet.message_id,
            attempts = self.attempts(),
            "Delivery failed."
        );
        self.ctx.transition(ConnectionState::Degraded);
        Err(Error::DeliverabilityExhausted {
            message_id: packet.message_id,
            attempts: self.attempts(),
        })
    }

    /// Resolve the send waiting on `ack_num`. Returns whether one was
    /// waiting.
    pub fn acknowledge(&self, ack_num: u8) -> bool {
        match self.pending.lock().waiters.remove(&ack_num) {
            Some(waiter) => {
                let _ = waiter.acked.send(());
                true
            }
            None => {
                trace!(identity = %self.ctx.identity(), ack_num, "Unexpected acknowledgement.");
                false
            }
        }
    }

    /// Fail every outstanding send with a closed-connection error.
    pub fn cancel_all(&self) {
        self.pending.lock().waiters.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    fn register(&self) -> Result<(AckSlot<'_>, oneshot::Receiver<()>)> {
        let mut pending = self.pending.lock();
        pending.next_key += 1;
        let key = pending.next_key;
        for _ in 0..u8::MAX {
            pending.next_ack = match pending.next_ack {
                u8::MAX => 1,
                n => n + 1,
            };
            let candidate = pending.next_ack;
            if !pending.waiters.contains_key(&candidate) {
                let (acked, rx) = oneshot::channel();
                pending.waiters.insert(candidate, Waiter { key, acked });
                let slot = AckSlot {
                    manager: self,
                    ack_num: candidate,
                    key,
                };
                return Ok((slot, rx));
            }
        }
        Err(Error::Other("all acknowledgement numbers are in use".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::drained_context;
    use crate::protocol::TypeTag;
    use test_case::test_case;

    #[test_case(0 ; "no retries")]
    #[test_case(2 ; "two retries")]
    #[test_case(5 ; "five retries")]
    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_configured_retries(max_retries: u32) {
        let (ctx, written) = drained_context();
        ctx.transition(ConnectionState::Connecting);
        ctx.transition(ConnectionState::Handshaking);
        ctx.transition(ConnectionState::Connected);
        let manager = DeliverabilityManager::new(ctx.clone(), Duration::from_millis(3000), max_retries);

        let result = manager
            .send(Packet::raw("relay", TypeTag::Uint8, vec![1]).with_ack())
            .await;

        assert!(matches!(
            result,
            Err(Error::DeliverabilityExhausted { attempts, .. }) if attempts == max_retries + 1
        ));
        assert_eq!(written.lock().len() as u32, max_retries + 1);
        assert_eq!(ctx.state(), ConnectionState::Degraded);
        assert_eq!(manager.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_completes_send() {
        let (ctx, written) = drained_context();
        let manager = Arc::new(DeliverabilityManager::new(ctx, Duration::from_millis(1000), 3));

        let sender = manager.clone();
        let send = tokio::spawn(async move {
            sender
                .send(Packet::raw("relay", TypeTag::Uint8, vec![1]).with_ack())
                .await
        });

        time::sleep(Duration::from_millis(1500)).await;
        let ack_num = written.lock()[0].ack_num;
        assert!(manager.acknowledge(ack_num));

        send.await.unwrap().unwrap();
        assert_eq!(written.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_plain_send_is_not_tracked() {
        let (ctx, written) = drained_context();
        let manager = DeliverabilityManager::new(ctx, Duration::from_millis(1000), 3);

        manager
            .send(Packet::raw("led", TypeTag::Uint8, vec![1]))
            .await
            .unwrap();

        assert_eq!(manager.outstanding(), 0);
        assert_eq!(written.lock()[0].ack_num, 0);
    }

    #[tokio::test]
    async fn test_ack_numbers_skip_zero() {
        let (ctx, _) = drained_context();
        let manager = DeliverabilityManager::new(ctx, Duration::from_millis(1000), 0);
        let mut seen = Vec::new();
        for _ in 0..300 {
            let (slot, _rx) = manager.register().unwrap();
            assert!(manager.acknowledge(slot.ack_num));
            seen.push(slot.ack_num);
        }
        assert!(!seen.contains(&0));
        assert_eq!(seen[255], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_sends_free_their_ack_numbers() {
        let (ctx, written) = drained_context();
        let manager = DeliverabilityManager::new(ctx, Duration::from_millis(1000), 3);

        for _ in 0..300 {
            let send = manager.send(Packet::raw("relay", TypeTag::Uint8, vec![1]).with_ack());
            assert!(time::timeout(Duration::from_millis(1), send).await.is_err());
        }
        assert_eq!(manager.outstanding(), 0);

        let manager = Arc::new(manager);
        let sender = manager.clone();
        let send = tokio::spawn(async move {
            sender
                .send(Packet::raw("relay", TypeTag::Uint8, vec![2]).with_ack())
                .await
        });
        while written.lock().len() < 301 {
            tokio::task::yield_now().await;
        }
        let ack_num = written.lock()[300].ack_num;
        assert!(manager.acknowledge(ack_num));
        send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_does_not_free_a_reused_number() {
        let (ctx, _) = drained_context();
        let manager = DeliverabilityManager::new(ctx, Duration::from_millis(1000), 0);

        let (first, _rx) = manager.register().unwrap();
        assert!(manager.acknowledge(first.ack_num));
        // Another send takes the number before the first slot is dropped.
        let (second, _rx2) = {
            let mut pending = manager.pending.lock();
            pending.next_ack = first.ack_num - 1;
            drop(pending);
            manager.register().unwrap()
        };
        assert_eq!(second.ack_num, first.ack_num);

        drop(first);
        assert_eq!(manager.outstanding(), 1);
        drop(second);
        assert_eq!(manager.outstanding(), 0);
    }
}
