//! Pending-call table.
//!
//! One entry per in-flight request id, holding the sender half of a oneshot.
//! An entry is removed exactly once: by the dispatcher when the matching
//! response arrives, or by the waiting call's [`PendingGuard`] when it gives
//! up (timeout or cancellation). Whichever runs second finds nothing and
//! does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{ProxyError, Result};
use crate::lock;
use crate::protocol::Response;

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a pending call. Fails if `id` is already pending.
    pub(crate) fn register(&self, id: &str) -> Result<oneshot::Receiver<Response>> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(id) {
            return Err(ProxyError::DuplicateId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Settle the call for `id`. Returns `false` if nothing was pending.
    pub(crate) fn complete(&self, id: &str, response: Response) -> bool {
        let Some(tx) = lock(&self.entries).remove(id) else {
            return false;
        };
        // The waiter may have been dropped between removal and send.
        tx.send(response).is_ok()
    }

    /// Forget `id` without settling it.
    pub(crate) fn remove(&self, id: &str) -> bool {
        lock(&self.entries).remove(id).is_some()
    }

    /// Drop every entry; their waiters observe a closed channel.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.entries).drain().collect();
        drained.len()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Removes a pending entry when the waiting call ends, however it ends.
pub(crate) struct PendingGuard {
    table: Arc<PendingTable>,
    id: String,
}

impl PendingGuard {
    pub(crate) fn new(table: Arc<PendingTable>, id: String) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.remove(&self.id) {
            tracing::trace!(id = %self.id, "pending call abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_delivers_response() {
        let table = PendingTable::new();
        let rx = table.register("1").unwrap();

        assert!(table.complete("1", Response::result("1", json!("ok"))));
        assert_eq!(rx.await.unwrap().res, json!("ok"));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingTable::new();
        let _rx = table.register("1").unwrap();

        assert!(matches!(table.register("1"), Err(ProxyError::DuplicateId(id)) if id == "1"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_second_settlement_is_noop() {
        let table = PendingTable::new();
        let _rx = table.register("1").unwrap();

        assert!(table.complete("1", Response::result("1", json!(1))));
        assert!(!table.complete("1", Response::result("1", json!(2))));
        assert!(!table.remove("1"));
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let table = PendingTable::new();
        assert!(!table.complete("ghost", Response::result("ghost", json!(null))));
        assert!(!table.remove("ghost"));
    }

    #[test]
    fn test_id_reusable_after_settlement() {
        let table = PendingTable::new();
        let _rx = table.register("1").unwrap();
        table.remove("1");
        assert!(table.register("1").is_ok());
    }

    #[tokio::test]
    async fn test_clear_closes_waiters() {
        let table = PendingTable::new();
        let rx1 = table.register("1").unwrap();
        let rx2 = table.register("2").unwrap();

        assert_eq!(table.clear(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let table = Arc::new(PendingTable::new());
        let _rx = table.register("1").unwrap();

        {
            let _guard = PendingGuard::new(table.clone(), "1".into());
            assert_eq!(table.len(), 1);
        }

        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_guard_after_completion_is_noop() {
        let table = Arc::new(PendingTable::new());
        let _rx = table.register("1").unwrap();
        let guard = PendingGuard::new(table.clone(), "1".into());

        table.complete("1", Response::result("1", json!(null)));
        drop(guard);

        assert_eq!(table.len(), 0);
    }
}
