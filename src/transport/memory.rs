//! In-process channel pair.
//!
//! Two [`MemoryChannel`] endpoints share a pair of mailboxes. A post on one
//! endpoint is fanned out to every current subscriber of the other, stamped
//! with the posting endpoint's origin.
//!
//! # Example
//!
//! ```
//! use service_proxy::transport::{Channel, MemoryChannel};
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (host, frame) = MemoryChannel::pair("https://host.app", "https://frame.app");
//! let mut sub = frame.subscribe();
//!
//! host.post(Bytes::from_static(b"ping"));
//!
//! let env = sub.recv().await.unwrap();
//! assert_eq!(env.origin, "https://host.app");
//! assert_eq!(&env.payload[..], b"ping");
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Channel, Envelope, Subscription, SubscriptionId};
use crate::lock;

/// Subscribers of one side of the pair.
#[derive(Debug, Default)]
struct Mailbox {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<Envelope>)>>,
    next_id: AtomicU64,
}

impl Mailbox {
    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push((id, tx));
        Subscription::new(id, rx)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.subscribers).retain(|(sub_id, _)| *sub_id != id);
    }

    fn deliver(&self, envelope: Envelope) {
        let mut subscribers = lock(&self.subscribers);
        // Subscriptions dropped without unsubscribing are pruned here.
        subscribers.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
        if subscribers.is_empty() {
            tracing::trace!(origin = %envelope.origin, "message posted with no subscribers");
        }
    }

    fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// One endpoint of an in-process channel pair.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    origin: String,
    inbox: Arc<Mailbox>,
    peer: Arc<Mailbox>,
}

impl MemoryChannel {
    /// Create two connected endpoints with the given origins.
    ///
    /// Messages posted on the first are received by the second with
    /// `origin_a` as their reported origin, and vice versa.
    pub fn pair(origin_a: impl Into<String>, origin_b: impl Into<String>) -> (Self, Self) {
        let inbox_a = Arc::new(Mailbox::default());
        let inbox_b = Arc::new(Mailbox::default());

        let a = Self {
            origin: origin_a.into(),
            inbox: inbox_a.clone(),
            peer: inbox_b.clone(),
        };
        let b = Self {
            origin: origin_b.into(),
            inbox: inbox_b,
            peer: inbox_a,
        };

        (a, b)
    }

    /// The origin stamped on messages posted from this endpoint.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Post with an arbitrary reported origin.
    ///
    /// Origins are self-reported, so any sender can claim any address; this
    /// lets tests play an untrusted sender.
    pub fn post_as(&self, origin: impl Into<String>, payload: Bytes) {
        self.peer.deliver(Envelope {
            origin: origin.into(),
            payload,
        });
    }

    /// Number of live subscriptions on this endpoint.
    pub fn subscriber_count(&self) -> usize {
        self.inbox.len()
    }
}

impl Channel for MemoryChannel {
    fn post(&self, payload: Bytes) {
        self.peer.deliver(Envelope {
            origin: self.origin.clone(),
            payload,
        });
    }

    fn subscribe(&self) -> Subscription {
        self.inbox.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inbox.unsubscribe(id);
    }
}
