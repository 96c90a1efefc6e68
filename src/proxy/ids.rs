//! Request id generation.
//!
//! Ids only need to be unique among the calls pending on one proxy. The
//! default [`SequentialIds`] is a per-proxy counter; any `Fn() -> String`
//! can be plugged in instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces request ids.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn next_id(&self) -> String {
        self()
    }
}

/// Decimal counter starting at 1.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// A counter whose first id is `"1"`.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}
