//! Transport module - the message channel between two contexts.
//!
//! A [`Channel`] is best effort: posting never waits for the peer, delivery
//! order is not part of the contract, and every inbound [`Envelope`] carries
//! the sender's self-reported address, which the receiver must validate
//! before trusting the payload.
//!
//! - [`MemoryChannel`] - in-process endpoint pair (tests, demos, embedding)

mod memory;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use memory::MemoryChannel;

/// An inbound message as delivered by the channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Address the sender claims to have. Not verified by the channel.
    pub origin: String,
    /// Encoded message.
    pub payload: Bytes,
}

/// Identifies one subscription on a channel.
pub type SubscriptionId = u64;

/// A live subscription to inbound messages.
///
/// Receives every envelope delivered after it was created, until
/// [`Channel::unsubscribe`] is called with its id or the channel is dropped.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Pair a subscription id with the receiving end of its queue.
    pub fn new(id: SubscriptionId, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { id, rx }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next inbound envelope, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Bidirectional, asynchronous, best-effort message transport.
///
/// Object safe, so both roles hold it as `Arc<dyn Channel>`.
pub trait Channel: Send + Sync + 'static {
    /// Post a payload to the peer. Fire-and-forget: a peer that is gone or
    /// not listening simply never sees it.
    fn post(&self, payload: Bytes);

    /// Start receiving inbound messages.
    fn subscribe(&self) -> Subscription;

    /// Stop delivering to the given subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn post(&self, payload: Bytes) {
        (**self).post(payload)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        (**self).unsubscribe(id)
    }
}
