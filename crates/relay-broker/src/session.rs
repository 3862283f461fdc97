//! Connection session: the state around one accepted IPC socket.
//!
//! One `ConnectionSession` owns exactly one TCP stream's send side. The
//! reader half lives in the broker's accept loop (it needs the broker's
//! dispatch tables to classify incoming frames); the writer half is spawned
//! here and owns the only `mpsc::Receiver` draining into the socket, so
//! outbound frames from many callers never interleave mid-frame — a single
//! writer per connection, every other caller going through `enqueue`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use relay_proto::Frame;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::pending::PendingRequestTable;
use crate::registry::ServiceRegistry;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Draining,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Open,
            1 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            SessionState::Open => 0,
            SessionState::Draining => 1,
            SessionState::Closed => 2,
        }
    }
}

/// Returned by [`ConnectionSession::enqueue`] when the frame could not be
/// accepted onto the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("send queue is full")]
    QueueFull,
    #[error("session is not open")]
    SessionClosed,
}

/// One accepted IPC connection. Created by the broker's accept loop;
/// dropped once its writer task exits.
pub struct ConnectionSession {
    id: String,
    peer_addr: String,
    opened_at: Instant,
    state: AtomicU8,
    sender: mpsc::Sender<Frame>,
    registered_instances: Mutex<HashSet<String>>,
}

impl ConnectionSession {
    /// Construct a session bound to `sender`, the write half of a channel
    /// whose receiver has already been handed to [`run_writer`] (or an
    /// equivalent caller-owned writer task).
    pub fn new(id: impl Into<String>, peer_addr: impl Into<String>, sender: mpsc::Sender<Frame>) -> Self {
        Self {
            id: id.into(),
            peer_addr: peer_addr.into(),
            opened_at: Instant::now(),
            state: AtomicU8::new(SessionState::Open.to_u8()),
            sender,
            registered_instances: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Record that `instance_id` was registered through this session, so it
    /// can be purged from the registry on close.
    pub fn record_instance(&self, instance_id: impl Into<String>) {
        self.registered_instances
            .lock()
            .expect("lock poisoned")
            .insert(instance_id.into());
    }

    pub fn registered_instances(&self) -> Vec<String> {
        self.registered_instances
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Enqueue `frame` for this session's writer. Fails fast rather than
    /// blocking the caller — the dispatcher surfaces a full queue as
    /// `UNAVAILABLE`, never waits on it.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if self.state() != SessionState::Open {
            return Err(EnqueueError::SessionClosed);
        }
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::SessionClosed,
        })
    }

    /// Idempotent: `OPEN`/`DRAINING` → `CLOSED`. Purges this session's
    /// instances from `registry` and fails every pending request routed
    /// through it with `CONNECTION_LOST`, but only on the transition that
    /// actually closes the session — a second call is a no-op.
    pub fn close(&self, reason: &str, registry: &ServiceRegistry, pending: &PendingRequestTable) {
        let previous = self.state.swap(SessionState::Closed.to_u8(), Ordering::AcqRel);
        if SessionState::from_u8(previous) == SessionState::Closed {
            return;
        }
        tracing::info!(session_id = %self.id, reason, "session closed");
        registry.purge_session(&self.id);
        pending.cancel_all_for(&self.id);
    }

    /// Reject further enqueues while letting the writer flush what's already
    /// queued. A no-op once the session is already draining or closed.
    pub fn begin_drain(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Open.to_u8(),
            SessionState::Draining.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Drains `queue` and writes each frame to `writer` in arrival order, so no
/// two enqueuers' frames interleave mid-frame on the wire. Exits when the
/// queue is closed (all senders dropped) or a write fails. `max_frame_size`
/// is the configured `ipc.maxMessageSize`, enforced on every outbound frame.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut queue: mpsc::Receiver<Frame>,
    mut writer: W,
    max_frame_size: usize,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = frame.write_to_with_limit(&mut writer, max_frame_size).await {
            tracing::warn!(error = %err, "session writer failed, dropping connection");
            return;
        }
    }
}
