//! Event publisher/sequencer (C7): root-assigned monotonic sequence
//! numbers, upstream funneling, downward multicast, duplicate suppression,
//! and local subscription fan-out (§4.7).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::BrokerError;
use crate::message::{Flags, Message, MessageType};
use crate::router::Router;

struct Subscription {
    prefix: String,
    tx: mpsc::Sender<Message>,
}

/// Per-rank event state. The root rank assigns sequence numbers; every
/// other rank only forwards and dedups.
pub struct EventSequencer {
    is_root: bool,
    next_seq: AtomicU32,
    recv_seq: AtomicU32,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventSequencer {
    pub fn new(is_root: bool) -> Self {
        Self {
            is_root,
            next_seq: AtomicU32::new(1),
            recv_seq: AtomicU32::new(0),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register a local subscriber for every event whose topic starts with
    /// `prefix`. Used by modules and the local connector (§4.7 "local
    /// subscription requeue").
    pub fn subscribe(&self, prefix: impl Into<String>, tx: mpsc::Sender<Message>) {
        self.subscriptions.lock().unwrap().push(Subscription {
            prefix: prefix.into(),
            tx,
        });
    }

    /// Remove every subscription registered for exactly `prefix` (the
    /// `cmb.unsub` counterpart to `subscribe`).
    pub fn unsubscribe(&self, prefix: &str) {
        self.subscriptions.lock().unwrap().retain(|s| s.prefix != prefix);
    }

    /// Originate a new event at this rank. At the root, a sequence number
    /// is assigned immediately and the event is delivered and multicast
    /// directly. Everywhere else, the event is funneled upstream
    /// unsequenced, flagged UPSTREAM, for the root to assign and echo back
    /// down.
    pub async fn publish<T: Serialize>(
        &self,
        router: &Router,
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<(), BrokerError> {
        if self.is_root {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let msg = Message::event(topic, seq, payload)?;
            self.deliver_and_multicast(router, msg).await
        } else {
            let mut msg = Message::event(topic, 0, payload)?;
            msg.flags.set(Flags::UPSTREAM);
            router.overlay.send_parent(msg).await
        }
    }

    /// Handle an EVENT arriving from the overlay, regardless of direction.
    pub async fn receive(&self, router: &Router, msg: Message) -> Result<(), BrokerError> {
        debug_assert_eq!(msg.msg_type, MessageType::Event);

        if msg.flags.contains(Flags::UPSTREAM) {
            if self.is_root {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let mut out = msg;
                out.sequence = seq;
                out.flags = Flags::default();
                self.deliver_and_multicast(router, out).await
            } else {
                router.overlay.send_parent(msg).await
            }
        } else {
            self.dedup_deliver_multicast(router, msg).await
        }
    }

    /// Downward path: drop duplicates, log (but never retry) gaps, fan the
    /// event out to every child and every matching local subscriber.
    async fn dedup_deliver_multicast(&self, router: &Router, msg: Message) -> Result<(), BrokerError> {
        let previous = self.recv_seq.load(Ordering::SeqCst);
        if msg.sequence != 0 {
            if msg.sequence <= previous {
                return Ok(()); // duplicate, silently dropped
            }
            if msg.sequence > previous + 1 {
                warn!(
                    expected = previous + 1,
                    got = msg.sequence,
                    topic = %msg.topic,
                    "event sequence gap detected, not retried"
                );
            }
            self.recv_seq.store(msg.sequence, Ordering::SeqCst);
        }
        self.deliver_and_multicast(router, msg).await
    }

    async fn deliver_and_multicast(&self, router: &Router, msg: Message) -> Result<(), BrokerError> {
        self.deliver_local(&msg);
        router.overlay.multicast_children(msg).await
    }

    fn deliver_local(&self, msg: &Message) {
        let subs = self.subscriptions.lock().unwrap();
        for sub in subs.iter() {
            if msg.topic.starts_with(&sub.prefix) {
                let _ = sub.tx.try_send(msg.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::ChannelOverlay;
    use std::sync::Arc;

    fn root_router() -> Arc<Router> {
        Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)))
    }

    #[tokio::test]
    async fn root_publish_assigns_sequence_and_delivers_locally() {
        let router = root_router();
        let (tx, mut rx) = mpsc::channel(8);
        router.events.subscribe("temp.", tx);

        router.events.publish(&router, "temp.reading", &42i32).await.unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.sequence, 1);
        assert_eq!(delivered.decode::<i32>().unwrap(), 42);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_dropped() {
        let router = root_router();
        let (tx, mut rx) = mpsc::channel(8);
        router.events.subscribe("x.", tx);

        let msg = Message::event("x.a", 5, &()).unwrap();
        router.events.receive(&router, msg.clone()).await.unwrap();
        router.events.receive(&router, msg).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_root_funnels_publish_upstream() {
        let (up_tx, mut up_rx) = mpsc::channel(8);
        let mut overlay = ChannelOverlay::new(1, 4, 2);
        overlay.set_parent_link(up_tx, mpsc::channel(1).1);
        let router = Router::new(Arc::new(overlay));

        router.events.publish(&router, "x.y", &1i32).await.unwrap();
        let forwarded = up_rx.recv().await.unwrap();
        assert!(forwarded.flags.contains(Flags::UPSTREAM));
        assert_eq!(forwarded.sequence, 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let router = root_router();
        let (tx, mut rx) = mpsc::channel(8);
        router.events.subscribe("foo.", tx);
        router.events.unsubscribe("foo.");

        router.events.publish(&router, "foo.bar", &1i32).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_matches_only_matching_prefix() {
        let router = root_router();
        let (tx, mut rx) = mpsc::channel(8);
        router.events.subscribe("foo.", tx);

        router.events.publish(&router, "bar.baz", &1i32).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
