//! Table of outstanding requests awaiting correlated responses.

use crate::protocol::ResponseError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use tokio::sync::oneshot;

/// Terminal state of one pending request.
#[derive(Debug)]
pub(crate) enum RequestOutcome {
    Result(Value),
    Error(ResponseError),
    ShuttingDown,
}

struct PendingEntry {
    /// Kept for log lines when the entry is torn down without a response.
    method: String,
    tx: oneshot::Sender<RequestOutcome>,
}

/// Correlation-id allocator plus the id -> waiting-caller map.
///
/// Ids are monotonically increasing per broker instance, across all
/// sessions. Each entry is removed exactly once: by a matching response,
/// by the caller abandoning it on timeout, or by [`reject_all`] at
/// shutdown.
pub(crate) struct PendingRequests {
    next_id: AtomicI64,
    entries: Mutex<HashMap<i64, PendingEntry>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next correlation id and register a waiting caller.
    ///
    /// The entry is registered before the request is written out so a
    /// response racing the send cannot be lost.
    pub(crate) async fn register(&self, method: &str) -> (i64, oneshot::Receiver<RequestOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().await;
        entries.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                tx,
            },
        );
        (id, rx)
    }

    /// Route an outcome to the waiting caller. Returns false when no entry
    /// matches the id (late or stray response).
    pub(crate) async fn complete(&self, id: i64, outcome: RequestOutcome) -> bool {
        let entry = self.entries.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                // The receiver may already be gone; that is fine.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Abandon an entry without resolving it (timeout or failed send).
    pub(crate) async fn discard(&self, id: i64) {
        self.entries.lock().await.remove(&id);
    }

    /// Reject every outstanding request and clear the table.
    pub(crate) async fn reject_all(&self) -> Vec<String> {
        let entries = std::mem::take(&mut *self.entries.lock().await);
        entries
            .into_values()
            .map(|entry| {
                let _ = entry.tx.send(RequestOutcome::ShuttingDown);
                entry.method
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn ids_are_monotonic() {
        let pending = PendingRequests::new();
        let (first, _rx1) = pending.register("textDocument/hover").await;
        let (second, _rx2) = pending.register("textDocument/definition").await;
        assert!(second > first);
        assert_eq!(pending.len().await, 2);
    }

    #[tokio::test]
    async fn complete_routes_to_the_matching_entry() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register("textDocument/hover").await;
        assert!(pending.complete(id, RequestOutcome::Result(json!(1))).await);
        match rx.await.expect("outcome delivered") {
            RequestOutcome::Result(value) => assert_eq!(value, json!(1)),
            other => panic!("expected result, got {other:?}"),
        }
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn unmatched_id_reports_false() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(99, RequestOutcome::Result(json!(null))).await);
    }

    #[tokio::test]
    async fn reject_all_resolves_every_entry() {
        let pending = PendingRequests::new();
        let (_id1, rx1) = pending.register("a").await;
        let (_id2, rx2) = pending.register("b").await;
        let mut methods = pending.reject_all().await;
        methods.sort();
        assert_eq!(methods, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(rx1.await, Ok(RequestOutcome::ShuttingDown)));
        assert!(matches!(rx2.await, Ok(RequestOutcome::ShuttingDown)));
        assert_eq!(pending.len().await, 0);
    }
}
