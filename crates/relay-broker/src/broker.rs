//! IPC broker: the TCP accept loop and per-frame dispatch entry. Owns the
//! registry, the pending-request table, and the session table that ties an
//! instance back to a live socket — everything else is a method call
//! against those three collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use relay_proto::{DispatchError, Frame, FrameType, RegisterPayload};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::dispatcher::Dispatcher;
use crate::pending::{self, PendingRequestTable};
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::session::{run_writer, ConnectionSession};

/// Everything a running broker needs, constructed once at startup and
/// shared by the accept loop, the dispatcher, and the HTTP front-door.
/// Explicit construction, never a global static — the registry, the
/// pending table, and the session map all live on this struct and are
/// handed to collaborators by reference.
pub struct Broker {
    pub registry: Arc<ServiceRegistry>,
    pub pending: Arc<PendingRequestTable>,
    pub sessions: Arc<DashMap<String, Arc<ConnectionSession>>>,
    pub dispatcher: Arc<Dispatcher>,
    send_queue_size: usize,
    /// Deadline budget for an inbound REQUEST forwarded callback-style to
    /// another backend. HTTP-originated envelopes carry their own deadline
    /// from `transport.timeout` and don't use this value.
    inbound_request_timeout: Duration,
    /// Configured `ipc.maxMessageSize`, enforced on both the decode side (the
    /// reader loop below) and the encode side (each session's writer).
    max_frame_size: usize,
    next_session_seq: AtomicU64,
}

impl Broker {
    pub fn new(send_queue_size: usize, inbound_request_timeout: Duration, max_frame_size: usize) -> Self {
        let registry = Arc::new(ServiceRegistry::new());
        let pending = Arc::new(PendingRequestTable::new());
        let sessions: Arc<DashMap<String, Arc<ConnectionSession>>> = Arc::new(DashMap::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), pending.clone(), sessions.clone()));
        Self {
            registry,
            pending,
            sessions,
            dispatcher,
            send_queue_size,
            inbound_request_timeout,
            max_frame_size,
            next_session_seq: AtomicU64::new(0),
        }
    }

    /// Accept connections on `listener` until `shutdown` fires. Each
    /// accepted socket gets a reader task (this function) driving frame
    /// classification and a writer task (spawned via [`run_writer`]).
    pub async fn run_accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let broker = self.clone();
                            let shutdown_rx = shutdown.resubscribe();
                            tokio::spawn(async move {
                                broker.handle_connection(stream, peer_addr.to_string(), shutdown_rx).await;
                            });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("accept loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: String,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let session_id = format!("{peer_addr}#{}", self.next_session_seq.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(self.send_queue_size);
        let session = Arc::new(ConnectionSession::new(session_id.clone(), peer_addr.clone(), tx));
        self.sessions.insert(session_id.clone(), session.clone());

        let writer_task = tokio::spawn(run_writer(rx, write_half, self.max_frame_size));

        tracing::info!(session_id = %session_id, peer_addr = %peer_addr, "session opened");

        let mut reader = read_half;
        loop {
            tokio::select! {
                decoded = Frame::decode_with_limit(&mut reader, self.max_frame_size) => {
                    match decoded {
                        Ok(frame) => self.handle_frame(&session, frame).await,
                        Err(err) => {
                            tracing::warn!(session_id = %session_id, error = %err, "frame decode failed, closing session");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!(session_id = %session_id, "draining session for shutdown");
                    session.begin_drain();
                    break;
                }
            }
        }

        session.close("reader loop exited", &self.registry, &self.pending);
        self.sessions.remove(&session_id);
        drop(session); // last Arc reference; dropping it drops the sender half, closing the writer's queue
        let _ = writer_task.await;
    }

    /// Classify one decoded frame by its type and route it accordingly.
    async fn handle_frame(&self, session: &Arc<ConnectionSession>, frame: Frame) {
        match frame.frame_type {
            FrameType::Register => self.handle_register(session, frame),
            FrameType::Heartbeat => self.handle_heartbeat(session, &frame),
            FrameType::Response => {
                let id = frame.id.clone();
                self.pending.complete(&id, frame);
            }
            FrameType::Request => self.handle_inbound_request(session, frame).await,
        }
    }

    fn handle_register(&self, session: &Arc<ConnectionSession>, frame: Frame) {
        let parsed: Result<RegisterPayload, _> = serde_json::from_slice(&frame.payload);
        let payload = match parsed {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(session_id = %session.id(), error = %err, "malformed REGISTER payload, closing session");
                session.close("protocol error: malformed REGISTER", &self.registry, &self.pending);
                return;
            }
        };

        let instance_id = format!("{}-{}", payload.name, session.peer_addr());
        let instance = Arc::new(ServiceInstance::new(
            instance_id.clone(),
            payload.name,
            session.peer_addr(),
            payload.metadata.into_iter().collect(),
            session.id(),
        ));
        self.registry.register(instance);
        session.record_instance(instance_id);
    }

    fn handle_heartbeat(&self, session: &Arc<ConnectionSession>, frame: &Frame) {
        if frame.id.is_empty() {
            for instance_id in session.registered_instances() {
                self.registry.heartbeat(&instance_id);
            }
        } else {
            self.registry.heartbeat(&frame.id);
        }
    }

    /// An inbound REQUEST is a backend calling another backend through the
    /// broker: dispatched the same way as an HTTP-originated call, with the
    /// sending session as the eventual RESPONSE recipient.
    async fn handle_inbound_request(&self, session: &Arc<ConnectionSession>, frame: Frame) {
        let envelope = relay_proto::Envelope {
            request_id: frame.id.clone(),
            service: frame.service.clone(),
            method: frame.method.clone(),
            body: frame.payload.to_vec(),
            metadata: frame.metadata.clone(),
            deadline: std::time::Instant::now() + self.inbound_request_timeout,
        };

        let reply_session = session.clone();
        let request_id = frame.id.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(envelope).await;
            let response = match outcome {
                Ok(resp) => Frame::response(request_id.clone())
                    .with_metadata(resp.metadata)
                    .with_payload(resp.body),
                Err(err) => Frame::response(request_id.clone())
                    .with_metadata(error_metadata(&err))
                    .with_payload(Vec::new()),
            };
            let _ = reply_session.enqueue(response);
        });
    }
}

fn error_metadata(err: &DispatchError) -> std::collections::BTreeMap<String, String> {
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("status".to_string(), err.http_status().to_string());
    metadata
}

/// Spawns the registry expiry sweep and the pending-request timeout sweep,
/// the small fixed set of background housekeeping tasks the broker runs.
pub fn spawn_background_sweepers(
    broker: &Arc<Broker>,
    cleanup_interval: Duration,
    instance_expiry: Duration,
    shutdown: &broadcast::Sender<()>,
) {
    let registry = broker.registry.clone();
    let mut registry_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => registry.sweep_expired(instance_expiry),
                _ = registry_shutdown.recv() => {
                    tracing::info!("registry expiry sweeper shutting down");
                    break;
                }
            }
        }
    });

    let pending = broker.pending.clone();
    let pending_shutdown = shutdown.subscribe();
    tokio::spawn(pending::run_timeout_sweeper(pending, cleanup_interval, pending_shutdown));
}
