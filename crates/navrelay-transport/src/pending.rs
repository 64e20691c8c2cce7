//! Request/response correlation table.
//!
//! A waiter registers a one-shot handler under its request id *before* the
//! request is sent. The handler is removed on the first of: a matching
//! reply, the waiter's timeout, or the waiter being dropped. A reply that
//! arrives after removal finds nothing and is reported as unmatched.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

struct Slot<T> {
    seq: u64,
    target: Option<String>,
    tx: oneshot::Sender<T>,
}

/// Why a registered handler finished without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingError {
    TimedOut,
    /// The handler was dropped from the table (channel closed, table cleared).
    Abandoned,
}

pub struct PendingRequests<T> {
    slots: Arc<DashMap<String, Slot<T>>>,
    next_seq: AtomicU64,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `request_id`, optionally tagged with the
    /// target it was sent to so it can be failed when that target goes away.
    pub fn register(&self, request_id: impl Into<String>, target: Option<String>) -> PendingReply<T> {
        let request_id = request_id.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots
            .insert(request_id.clone(), Slot { seq, target, tx });
        PendingReply {
            request_id,
            seq,
            rx,
            slots: self.slots.clone(),
        }
    }

    /// Deliver a reply. Returns false when no handler is waiting for it.
    pub fn resolve(&self, request_id: &str, value: T) -> bool {
        match self.slots.remove(request_id) {
            Some((_, slot)) => slot.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Deliver a reply only if it comes from the target the request was sent
    /// to. A reply from anyone else leaves the handler waiting.
    pub fn resolve_from(&self, request_id: &str, sender: &str, value: T) -> bool {
        match self
            .slots
            .remove_if(request_id, |_, slot| slot.target.as_deref() == Some(sender))
        {
            Some((_, slot)) => slot.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Complete every handler whose target matches, using `make` to build
    /// the value each one receives. Returns how many were completed.
    pub fn fail_where(
        &self,
        matches: impl Fn(Option<&str>) -> bool,
        make: impl Fn(&str) -> T,
    ) -> usize {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| matches(entry.value().target.as_deref()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((id, slot)) = self.slots.remove(&id) {
                if slot.tx.send(make(&id)).is_ok() {
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Drop every handler; their waiters observe [`PendingError::Abandoned`].
    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.slots.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The waiting half of a registered handler. Dropping it removes the handler.
pub struct PendingReply<T> {
    request_id: String,
    seq: u64,
    rx: oneshot::Receiver<T>,
    slots: Arc<DashMap<String, Slot<T>>>,
}

impl<T> PendingReply<T> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<T, PendingError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(PendingError::Abandoned),
            Err(_) => Err(PendingError::TimedOut),
        }
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        // Only remove our own slot; the id may have been re-registered.
        let seq = self.seq;
        self.slots.remove_if(&self.request_id, |_, slot| slot.seq == seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_once() {
        let table = PendingRequests::<u32>::new();
        let reply = table.register("a", None);
        assert!(table.resolve("a", 7));
        assert!(!table.resolve("a", 8));
        assert_eq!(reply.wait(Duration::from_secs(1)).await, Ok(7));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn timeout_removes_handler() {
        let table = PendingRequests::<u32>::new();
        let reply = table.register("a", None);
        assert_eq!(
            reply.wait(Duration::from_millis(5)).await,
            Err(PendingError::TimedOut)
        );
        assert!(!table.contains("a"));
        assert!(!table.resolve("a", 1));
    }

    #[tokio::test]
    async fn dropping_waiter_removes_handler() {
        let table = PendingRequests::<u32>::new();
        let reply = table.register("a", None);
        assert_eq!(table.len(), 1);
        drop(reply);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stale_guard_keeps_newer_registration() {
        let table = PendingRequests::<u32>::new();
        let old = table.register("a", None);
        let new = table.register("a", None);
        drop(old);
        assert!(table.contains("a"));
        assert!(table.resolve("a", 3));
        assert_eq!(new.wait(Duration::from_secs(1)).await, Ok(3));
    }

    #[tokio::test]
    async fn fail_where_targets_one_client() {
        let table = PendingRequests::<Result<u32, String>>::new();
        let to_c1 = table.register("r1", Some("c1".into()));
        let to_c2 = table.register("r2", Some("c2".into()));

        let failed = table.fail_where(|t| t == Some("c1"), |id| Err(format!("{id} gone")));
        assert_eq!(failed, 1);
        assert_eq!(
            to_c1.wait(Duration::from_secs(1)).await,
            Ok(Err("r1 gone".to_string()))
        );
        assert!(table.contains("r2"));
        drop(to_c2);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reply_from_other_target_is_ignored() {
        let table = PendingRequests::<u32>::new();
        let reply = table.register("r1", Some("c1".into()));
        assert!(!table.resolve_from("r1", "c2", 9));
        assert!(table.contains("r1"));
        assert!(table.resolve_from("r1", "c1", 4));
        assert_eq!(reply.wait(Duration::from_secs(1)).await, Ok(4));
    }

    #[tokio::test]
    async fn clear_abandons_waiters() {
        let table = PendingRequests::<u32>::new();
        let reply = table.register("a", None);
        table.clear();
        assert_eq!(
            reply.wait(Duration::from_secs(1)).await,
            Err(PendingError::Abandoned)
        );
    }
}
