//! Pending-request tracker
//!
//! Correlates an approval or input request id with the suspended caller
//! waiting on it. Each entry is a one-shot channel plus a snapshot of the
//! request context kept for state inspection.

use tokio::sync::oneshot;

struct Entry<C, R> {
    id: String,
    context: C,
    reply: oneshot::Sender<R>,
}

/// Insertion-ordered map of id → (context, waiter).
pub struct PendingRequests<C, R> {
    entries: Vec<Entry<C, R>>,
}

impl<C, R> Default for PendingRequests<C, R> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C, R> PendingRequests<C, R> {
    /// Register `id`, returning the receiver the caller suspends on.
    /// Re-registering an id cancels the previous waiter.
    pub fn register(&mut self, id: impl Into<String>, context: C) -> oneshot::Receiver<R> {
        let id = id.into();
        self.entries.retain(|entry| entry.id != id);
        let (reply, rx) = oneshot::channel();
        self.entries.push(Entry { id, context, reply });
        rx
    }

    /// Fulfil `id` exactly once. Returns false if the id is unknown, was
    /// already resolved, or its waiter is gone.
    pub fn resolve(&mut self, id: &str, value: R) -> bool {
        let Some(index) = self.entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let entry = self.entries.remove(index);
        entry.reply.send(value).is_ok()
    }

    /// Oldest outstanding request.
    pub fn first(&self) -> Option<(&str, &C)> {
        self.entries
            .first()
            .map(|entry| (entry.id.as_str(), &entry.context))
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
