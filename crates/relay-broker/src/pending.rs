//! Pending-request table: correlates an outbound REQUEST's id to the task
//! awaiting its RESPONSE.
//!
//! A concurrent map from request id to a `oneshot::Sender`, plus a periodic
//! sweep that fails entries whose deadline has passed. `complete` is a
//! single `DashMap::remove` plus a channel send — no lock is held across
//! the send, and the entry disappears from the table the instant it
//! resolves, so a later stray frame for the same id finds nothing to wake.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use relay_proto::{DispatchError, Frame};
use tokio::sync::oneshot;

/// Returned by [`PendingRequestTable::register`] when `id` is already in use.
#[derive(Debug, Clone, thiserror::Error)]
#[error("request id {0} is already pending")]
pub struct DuplicateId(pub String);

struct Entry {
    tx: oneshot::Sender<Result<Frame, DispatchError>>,
    deadline: Instant,
    session_id: String,
}

/// A single-shot handle a dispatcher task awaits until its request resolves.
pub struct Waiter {
    rx: oneshot::Receiver<Result<Frame, DispatchError>>,
}

impl Waiter {
    /// Wait for the matching RESPONSE, a failure, or the channel being
    /// dropped without resolution (treated as an internal error — it should
    /// never happen, since every code path that removes an entry also sends
    /// on its channel before dropping it).
    pub async fn wait(self) -> Result<Frame, DispatchError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Internal(
                "pending request entry dropped without resolving".to_string(),
            )),
        }
    }
}

/// Owned collaborator of the dispatcher — never a global singleton. One
/// instance lives for the life of the broker.
pub struct PendingRequestTable {
    entries: DashMap<String, Entry>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Reserve `id` with `deadline`, returning a [`Waiter`]. Fails with
    /// [`DuplicateId`] if `id` is already pending — id generation is the
    /// dispatcher's responsibility, not this table's.
    pub fn register(
        &self,
        id: impl Into<String>,
        deadline: Instant,
        session_id: impl Into<String>,
    ) -> Result<Waiter, DuplicateId> {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        match self.entries.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DuplicateId(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    tx,
                    deadline,
                    session_id: session_id.into(),
                });
                Ok(Waiter { rx })
            }
        }
    }

    /// Resolve `id`'s waiter with the matching RESPONSE frame. A no-op if
    /// `id` isn't present — a late response is silently dropped.
    pub fn complete(&self, id: &str, frame: Frame) {
        if let Some((_, entry)) = self.entries.remove(id) {
            let _ = entry.tx.send(Ok(frame));
        } else {
            tracing::debug!(request_id = %id, "dropping response for unknown or already-resolved request");
        }
    }

    /// Resolve `id`'s waiter with a failure. A no-op if `id` isn't present.
    pub fn fail(&self, id: &str, error: DispatchError) {
        if let Some((_, entry)) = self.entries.remove(id) {
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Fail every entry whose dispatch targeted `session_id` with
    /// `CONNECTION_LOST`. Called when that session transitions to CLOSED.
    pub fn cancel_all_for(&self, session_id: &str) {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.fail(&id, DispatchError::ConnectionLost);
        }
    }

    /// Fail every entry whose deadline has passed with `TIMEOUT`. Intended
    /// to be called periodically from a background task.
    pub fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now >= e.deadline)
            .map(|e| e.key().clone())
            .collect();
        for id in expired {
            self.fail(&id, DispatchError::Timeout);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically sweeps `table` for expired entries until `shutdown` fires.
/// One of the broker's small fixed set of background housekeeping tasks.
pub async fn run_timeout_sweeper(
    table: Arc<PendingRequestTable>,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => table.sweep_timeouts(),
            _ = shutdown.recv() => {
                tracing::info!("pending-request timeout sweeper shutting down");
                break;
            }
        }
    }
}
