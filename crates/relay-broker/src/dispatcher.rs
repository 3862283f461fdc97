//! Dispatcher: turns an HTTP-originated envelope into a correlated IPC call
//! and waits for its outcome.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use relay_proto::{DispatchError, Envelope, EnvelopeResponse, Frame};

use crate::pending::PendingRequestTable;
use crate::registry::ServiceRegistry;
use crate::session::ConnectionSession;

/// Bounds the number of dead-session retries a single dispatch will absorb
/// before giving up and returning `ServiceUnavailable`.
const MAX_SESSION_RETRIES: usize = 8;

/// Turns envelopes into correlated IPC calls. Owns no state of its own —
/// every collaborator it needs is passed in, so it stays trivially
/// testable and there is nowhere for a global singleton to creep in.
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    pending: Arc<PendingRequestTable>,
    sessions: Arc<DashMap<String, Arc<ConnectionSession>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pending: Arc<PendingRequestTable>,
        sessions: Arc<DashMap<String, Arc<ConnectionSession>>>,
    ) -> Self {
        Self {
            registry,
            pending,
            sessions,
        }
    }

    /// Run the full dispatch algorithm for `envelope`, returning either a
    /// successful response or the `DispatchError` that should be mapped to
    /// an HTTP status.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<EnvelopeResponse, DispatchError> {
        let mut tried = 0usize;

        loop {
            let instances = self.registry.discover(&envelope.service);
            if instances.is_empty() {
                return Err(DispatchError::ServiceUnavailable);
            }

            let Some(instance) = self.registry.select(&envelope.service) else {
                return Err(DispatchError::ServiceUnavailable);
            };

            let Some(session) = self.sessions.get(&instance.session_id).map(|s| s.clone()) else {
                self.retry_or_give_up(&mut tried)?;
                continue;
            };

            if !session.is_open() {
                self.retry_or_give_up(&mut tried)?;
                continue;
            }

            let waiter = match self.pending.register(
                envelope.request_id.clone(),
                envelope.deadline,
                session.id().to_string(),
            ) {
                Ok(waiter) => waiter,
                Err(_duplicate) => return Err(DispatchError::Internal("duplicate request id".to_string())),
            };

            let frame = Frame::request(envelope.request_id.clone(), envelope.service.clone(), envelope.method.clone())
                .with_metadata(envelope.metadata.clone())
                .with_payload(envelope.body.clone());

            if session.enqueue(frame).is_err() {
                self.pending.fail(&envelope.request_id, DispatchError::Unavailable);
            }

            return self.await_outcome(waiter, envelope.deadline).await;
        }
    }

    fn retry_or_give_up(&self, tried: &mut usize) -> Result<(), DispatchError> {
        *tried += 1;
        if *tried > MAX_SESSION_RETRIES {
            return Err(DispatchError::ServiceUnavailable);
        }
        Ok(())
    }

    async fn await_outcome(
        &self,
        waiter: crate::pending::Waiter,
        deadline: Instant,
    ) -> Result<EnvelopeResponse, DispatchError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match tokio::time::timeout(remaining, waiter.wait()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(DispatchError::Timeout),
        };

        outcome.and_then(|frame| {
            let status = frame
                .metadata
                .get("status")
                .and_then(|s| s.parse::<u16>().ok())
                .unwrap_or(200);

            if !(200..300).contains(&status) {
                return Err(DispatchError::Backend { status });
            }

            Ok(EnvelopeResponse {
                status,
                body: frame.payload.to_vec(),
                metadata: frame.metadata,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceInstance;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn envelope(service: &str) -> Envelope {
        Envelope {
            request_id: "r-1".to_string(),
            service: service.to_string(),
            method: "ping".to_string(),
            body: b"{}".to_vec(),
            metadata: BTreeMap::new(),
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    fn wired() -> (
        Dispatcher,
        Arc<ServiceRegistry>,
        Arc<PendingRequestTable>,
        Arc<DashMap<String, Arc<ConnectionSession>>>,
    ) {
        let registry = Arc::new(ServiceRegistry::new());
        let pending = Arc::new(PendingRequestTable::new());
        let sessions = Arc::new(DashMap::new());
        let dispatcher = Dispatcher::new(registry.clone(), pending.clone(), sessions.clone());
        (dispatcher, registry, pending, sessions)
    }

    #[tokio::test]
    async fn test_dispatch_with_no_instances_is_service_unavailable() {
        let (dispatcher, _registry, _pending, _sessions) = wired();
        let err = dispatcher.dispatch(envelope("demo")).await.unwrap_err();
        assert!(matches!(err, DispatchError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_dispatch_forwards_frame_and_resolves_on_response() {
        let (dispatcher, registry, pending, sessions) = wired();

        let (tx, mut rx) = mpsc::channel(4);
        let session = Arc::new(ConnectionSession::new("s1", "127.0.0.1:1", tx));
        sessions.insert("s1".to_string(), session);

        registry.register(Arc::new(ServiceInstance::new(
            "demo-1",
            "demo",
            "127.0.0.1:1",
            BTreeMap::new(),
            "s1",
        )));

        let responder = tokio::spawn(async move {
            let frame = rx.recv().await.expect("frame enqueued");
            pending.complete(&frame.id, Frame::response(frame.id.clone()).with_payload(b"pong".to_vec()));
        });

        let result = dispatcher.dispatch(envelope("demo")).await.unwrap();
        responder.await.unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.body, b"pong".to_vec());
    }

    #[tokio::test]
    async fn test_dispatch_maps_backend_signalled_status_to_dispatch_error() {
        let (dispatcher, registry, pending, sessions) = wired();

        let (tx, mut rx) = mpsc::channel(4);
        let session = Arc::new(ConnectionSession::new("s1", "127.0.0.1:1", tx));
        sessions.insert("s1".to_string(), session);

        registry.register(Arc::new(ServiceInstance::new(
            "demo-1",
            "demo",
            "127.0.0.1:1",
            BTreeMap::new(),
            "s1",
        )));

        let responder = tokio::spawn(async move {
            let frame = rx.recv().await.expect("frame enqueued");
            let mut metadata = BTreeMap::new();
            metadata.insert("status".to_string(), "422".to_string());
            pending.complete(
                &frame.id,
                Frame::response(frame.id.clone()).with_metadata(metadata).with_payload(b"bad input".to_vec()),
            );
        });

        let err = dispatcher.dispatch(envelope("demo")).await.unwrap_err();
        responder.await.unwrap();

        assert!(matches!(err, DispatchError::Backend { status: 422 }));
    }

    #[tokio::test]
    async fn test_dispatch_times_out_when_backend_never_responds() {
        let (dispatcher, registry, _pending, sessions) = wired();

        let (tx, _rx) = mpsc::channel(4);
        let session = Arc::new(ConnectionSession::new("s1", "127.0.0.1:1", tx));
        sessions.insert("s1".to_string(), session);

        registry.register(Arc::new(ServiceInstance::new(
            "demo-1",
            "demo",
            "127.0.0.1:1",
            BTreeMap::new(),
            "s1",
        )));

        let mut env = envelope("demo");
        env.deadline = Instant::now() + Duration::from_millis(50);

        let err = dispatcher.dispatch(env).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout));
    }

    #[tokio::test]
    async fn test_dispatch_retries_past_dead_session_entries() {
        let (dispatcher, registry, _pending, _sessions) = wired();
        // Instance references a session id that was never inserted into the
        // sessions map — the dispatcher must treat this as a dead session
        // and, finding no other candidate, give up with SERVICE_UNAVAILABLE.
        registry.register(Arc::new(ServiceInstance::new(
            "demo-1",
            "demo",
            "127.0.0.1:1",
            BTreeMap::new(),
            "ghost-session",
        )));

        let err = dispatcher.dispatch(envelope("demo")).await.unwrap_err();
        assert!(matches!(err, DispatchError::ServiceUnavailable));
    }
}
