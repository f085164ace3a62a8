//! Lock-free correlation table using `scc::HashMap`.
//!
//! Tracks outbound requests awaiting their response. Each entry is resolved
//! at most once: every resolution path removes the entry before signalling,
//! so a late or duplicated response finds nothing to complete.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::{
    error::{QueueError, QueueResult},
    types::RequestId,
};

/// A request awaiting its response.
pub struct PendingRequest<R> {
    /// Channel to deliver the outcome.
    pub response_tx: oneshot::Sender<QueueResult<R>>,
    /// Id reported when the stream fails, e.g. the message id of a send.
    pub identity: Option<String>,
    pub created_at: Instant,
    pub timeout: Duration,
}

/// Correlation table for one stream.
pub struct PendingStore<R> {
    requests: scc::HashMap<RequestId, PendingRequest<R>>,
    max_pending: usize,
}

impl<R> PendingStore<R> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register a correlation and return the receiver for its outcome.
    pub fn add(
        &self,
        id: RequestId,
        identity: Option<String>,
        timeout: Duration,
    ) -> QueueResult<oneshot::Receiver<QueueResult<R>>> {
        if self.requests.len() >= self.max_pending {
            return Err(QueueError::capacity_exceeded(format!(
                "max pending requests ({}) reached",
                self.max_pending
            )));
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            response_tx: tx,
            identity,
            created_at: Instant::now(),
            timeout,
        };

        // Insert returns Err if the key already exists
        if let Err((id, _)) = self.requests.insert_sync(id, pending) {
            return Err(QueueError::capacity_exceeded(format!(
                "duplicate request id {id}"
            )));
        }

        Ok(rx)
    }

    /// Complete a correlation. Returns `false` if it was not pending.
    pub fn resolve(&self, id: &RequestId, result: QueueResult<R>) -> bool {
        if let Some((_, pending)) = self.requests.remove_sync(id) {
            // Receiver may have given up already
            let _ = pending.response_tx.send(result);
            return true;
        }
        false
    }

    /// Drop a correlation without notifying the waiter.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.requests.remove_sync(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.read_sync(id, |_, _| ()).is_some()
    }

    /// Fail one entry with `ConnectionLost` carrying its identity.
    pub fn fail(&self, id: &RequestId, reason: &str) -> bool {
        if let Some((id, pending)) = self.requests.remove_sync(id) {
            let identity = pending.identity.unwrap_or_else(|| id.to_string());
            let _ = pending
                .response_tx
                .send(Err(QueueError::connection_lost(identity, reason)));
            return true;
        }
        false
    }

    /// Fail every entry with `ConnectionLost` carrying its identity.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.drain_with(|id, pending| {
            let identity = pending
                .identity
                .clone()
                .unwrap_or_else(|| id.to_string());
            QueueError::connection_lost(identity, reason)
        })
    }

    /// Fail every entry with the same error.
    pub fn fail_all_with(&self, error: &QueueError) -> usize {
        self.drain_with(|_, _| error.clone())
    }

    /// Fail entries whose timeout has elapsed.
    pub fn cleanup_stale_with_notify(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.requests.retain_sync(|id, pending| {
            if now.duration_since(pending.created_at) >= pending.timeout {
                expired.push(id.clone());
            }
            true
        });

        let mut failed = 0;
        for id in expired {
            if let Some((_, pending)) = self.requests.remove_sync(&id) {
                let identity = pending.identity.unwrap_or_else(|| id.to_string());
                let _ = pending
                    .response_tx
                    .send(Err(QueueError::request_timeout(pending.timeout, identity)));
                failed += 1;
            }
        }
        failed
    }

    pub fn has_capacity(&self) -> bool {
        self.requests.len() < self.max_pending
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn drain_with(&self, error: impl Fn(&RequestId, &PendingRequest<R>) -> QueueError) -> usize {
        let mut ids = Vec::new();
        self.requests.retain_sync(|id, _| {
            ids.push(id.clone());
            true
        });

        let mut failed = 0;
        for id in ids {
            if let Some((id, pending)) = self.requests.remove_sync(&id) {
                let err = error(&id, &pending);
                let _ = pending.response_tx.send(Err(err));
                failed += 1;
            }
        }
        failed
    }
}
