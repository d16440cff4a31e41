//! Request/response correlation.
//!
//! A query goes out with the query flag set; the device answers with a
//! packet carrying the same message identifier. Responses resolve waiters
//! for that identifier in the order the queries were sent. Each waiter has
//! a local deadline whose expiry yields [`Error::QueryCancelled`], never a
//! protocol error.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

use crate::connection::ConnectionContext;
use crate::error::{Error, Result};
use crate::protocol::{MessageId, Packet};
use crate::tracing::prelude::*;

/// One outstanding query.
struct PendingQuery {
    key: u64,
    respond: oneshot::Sender<Packet>,
}

#[derive(Default)]
struct Pending {
    next_key: u64,
    by_id: HashMap<MessageId, VecDeque<PendingQuery>>,
}

/// Withdraws a waiter when the query future is dropped before completing.
struct Waiting<'a> {
    manager: &'a QueryManager,
    message_id: MessageId,
    key: u64,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.message_id, self.key);
    }
}

pub struct QueryManager {
    ctx: Arc<ConnectionContext>,
    pending: Mutex<Pending>,
}

impl QueryManager {
    pub fn new(ctx: Arc<ConnectionContext>) -> Self {
        Self {
            ctx,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub async fn query(&self, request: Packet, deadline: Duration) -> Result<Packet> {
        let request = request.as_query();
        let message_id = request.message_id.clone();
        let (key, mut response) = self.register(&message_id);
        let _waiting = Waiting {
            manager: self,
            message_id: message_id.clone(),
            key,
        };

        self.ctx.transmit(request).await?;

        match time::timeout(deadline, &mut response).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(Error::ConnectionClosed(self.ctx.identity().to_string())),
            Err(_) => {
                // A response that won the race against the deadline is
                // already in the channel.
                if !self.release(&message_id, key) {
                    if let Ok(packet) = response.try_recv() {
                        return Ok(packet);
                    }
                }
                debug!(
                    identity = %self.ctx.identity(),
                    message_id = %message_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Query cancelled."
                );
                Err(Error::QueryCancelled {
                    message_id,
                    deadline,
                })
            }
        }
    }

    /// Hand a response to the oldest waiter for its identifier. Returns
    /// whether a waiter took it.
    pub fn resolve(&self, packet: &Packet) -> bool {
        let mut pending = self.pending.lock();
        let Some(queue) = pending.by_id.get_mut(&packet.message_id) else {
            return false;
        };
        let resolved = loop {
            match queue.pop_front() {
                Some(waiter) => {
                    if waiter.respond.send(packet.clone()).is_ok() {
                        break true;
                    }
                }
                None => break false,
            }
        };
        if queue.is_empty() {
            pending.by_id.remove(&packet.message_id);
        }
        resolved
    }

    /// Drop every waiter; each sees a closed-connection error.
    pub fn cancel_all(&self) {
        self.pending.lock().by_id.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().by_id.values().map(VecDeque::len).sum()
    }

    fn register(&self, message_id: &MessageId) -> (u64, oneshot::Receiver<Packet>) {
        let (respond, response) = oneshot::channel();
        let mut pending = self.pending.lock();
        pending.next_key += 1;
        let key = pending.next_key;
        pending
            .by_id
            .entry(message_id.clone())
            .or_default()
            .push_back(PendingQuery { key, respond });
        (key, response)
    }

    /// Remove a waiter. Returns whether it was still pending.
    fn release(&self, message_id: &MessageId, key: u64) -> bool {
        let mut pending = self.pending.lock();
        let Some(queue) = pending.by_id.get_mut(message_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|q| q.key != key);
        let removed = queue.len() != before;
        if queue.is_empty() {
            pending.by_id.remove(message_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::drained_context;
    use crate::protocol::TypeTag;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_cancels_query() {
        let (ctx, written) = drained_context();
        let manager = QueryManager::new(ctx);

        let result = manager
            .query(
                Packet::raw("name", TypeTag::Char, bytes::Bytes::new()),
                Duration::from_millis(10_000),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_cancellation());
        assert!(matches!(err, Error::QueryCancelled { deadline, .. } if deadline.as_millis() == 10_000));
        assert!(written.lock()[0].query);
        assert_eq!(manager.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_resolve_in_order() {
        let (ctx, _) = drained_context();
        let manager = Arc::new(QueryManager::new(ctx));

        let first = {
            let m = manager.clone();
            tokio::spawn(async move {
                m.query(Packet::raw("temp", TypeTag::Int16, bytes::Bytes::new()), Duration::from_secs(1))
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let m = manager.clone();
            tokio::spawn(async move {
                m.query(Packet::raw("temp", TypeTag::Int16, bytes::Bytes::new()), Duration::from_secs(1))
                    .await
            })
        };
        while manager.outstanding() < 2 {
            tokio::task::yield_now().await;
        }

        assert!(manager.resolve(&Packet::value("temp", TypeTag::Int16, json!(20))));
        assert!(manager.resolve(&Packet::value("temp", TypeTag::Int16, json!(21))));
        assert!(!manager.resolve(&Packet::value("temp", TypeTag::Int16, json!(22))));

        assert_eq!(first.await.unwrap().unwrap().as_value(), Some(&json!(20)));
        assert_eq!(second.await.unwrap().unwrap().as_value(), Some(&json!(21)));
    }

    #[tokio::test]
    async fn test_cancel_all_reports_closed() {
        let (ctx, _) = drained_context();
        let manager = Arc::new(QueryManager::new(ctx));
        let m = manager.clone();
        let waiter = tokio::spawn(async move {
            m.query(Packet::raw("name", TypeTag::Char, bytes::Bytes::new()), Duration::from_secs(60))
                .await
        });
        while manager.outstanding() == 0 {
            tokio::task::yield_now().await;
        }
        manager.cancel_all();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
        assert!(!err.is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_query_is_withdrawn() {
        let (ctx, _) = drained_context();
        let manager = QueryManager::new(ctx);

        let query = manager.query(
            Packet::raw("temp", TypeTag::Int16, bytes::Bytes::new()),
            Duration::from_secs(10),
        );
        assert!(time::timeout(Duration::from_millis(1), query).await.is_err());

        assert_eq!(manager.outstanding(), 0);
        assert!(!manager.resolve(&Packet::value("temp", TypeTag::Int16, json!(20))));
    }
}
