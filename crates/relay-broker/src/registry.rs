//! Service registry: maps service name -> the set of instances currently
//! registered under it, with heartbeat-driven expiry and round-robin
//! selection.
//!
//! Backed by a [`DashMap`], a sharded concurrent map, so many independent
//! service names get concurrent read/write access without a single global
//! lock. Each service's instance list and round-robin cursor live behind
//! their own lock, so `discover` for one service never contends with
//! `register` for another.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use dashmap::DashMap;

/// Lifecycle state of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Healthy,
    Expired,
}

impl InstanceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InstanceStatus::Healthy,
            _ => InstanceStatus::Expired,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            InstanceStatus::Healthy => 0,
            InstanceStatus::Expired => 1,
        }
    }
}

/// One registered occupant of a service name, owned by exactly one
/// connection session.
#[derive(Debug)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub remote_address: String,
    pub metadata: BTreeMap<String, String>,
    pub registered_at: Instant,
    /// Id of the owning [`crate::session::ConnectionSession`]. Used by the
    /// dispatcher to resolve a selected instance back to a live socket.
    pub session_id: String,

    last_heartbeat_at: Mutex<Instant>,
    status: AtomicU8,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        remote_address: impl Into<String>,
        metadata: BTreeMap<String, String>,
        session_id: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            name: name.into(),
            remote_address: remote_address.into(),
            metadata,
            registered_at: now,
            session_id: session_id.into(),
            last_heartbeat_at: Mutex::new(now),
            status: AtomicU8::new(InstanceStatus::Healthy.to_u8()),
        }
    }

    pub fn last_heartbeat_at(&self) -> Instant {
        *self.last_heartbeat_at.lock().expect("lock poisoned")
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn touch(&self) {
        *self.last_heartbeat_at.lock().expect("lock poisoned") = Instant::now();
        self.status.store(InstanceStatus::Healthy.to_u8(), Ordering::Release);
    }

    fn expire(&self) {
        self.status.store(InstanceStatus::Expired.to_u8(), Ordering::Release);
    }
}

struct ServiceEntry {
    instances: RwLock<Vec<std::sync::Arc<ServiceInstance>>>,
    cursor: AtomicUsize,
}

impl ServiceEntry {
    fn new() -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Concurrent mapping from service name to its registered instances.
pub struct ServiceRegistry {
    services: DashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Upsert an instance. Refreshes `lastHeartbeatAt` and marks it healthy
    /// even if it already existed (re-REGISTER is treated as a heartbeat).
    pub fn register(&self, instance: std::sync::Arc<ServiceInstance>) {
        let entry = self
            .services
            .entry(instance.name.clone())
            .or_insert_with(ServiceEntry::new);
        let mut instances = entry.instances.write().expect("lock poisoned");
        if let Some(existing) = instances.iter().find(|i| i.id == instance.id) {
            existing.touch();
        } else {
            instance.touch();
            instances.push(instance.clone());
        }
        tracing::info!(service = %instance.name, instance_id = %instance.id, "instance registered");
    }

    /// Remove exactly one instance by id, from whichever service it belongs to.
    pub fn deregister(&self, instance_id: &str) {
        for entry in self.services.iter() {
            let mut instances = entry.instances.write().expect("lock poisoned");
            let before = instances.len();
            instances.retain(|i| i.id != instance_id);
            if instances.len() != before {
                tracing::info!(instance_id = %instance_id, "instance deregistered");
                return;
            }
        }
    }

    /// Return only HEALTHY instances for `name`. Order is stable within one
    /// call but otherwise unspecified.
    pub fn discover(&self, name: &str) -> Vec<std::sync::Arc<ServiceInstance>> {
        match self.services.get(name) {
            Some(entry) => entry
                .instances
                .read()
                .expect("lock poisoned")
                .iter()
                .filter(|i| i.status() == InstanceStatus::Healthy)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Pick the next instance for `name` by round robin among currently
    /// HEALTHY instances. The rotation cursor lives on the per-service entry,
    /// never under a lock spanning the caller's dispatch.
    pub fn select(&self, name: &str) -> Option<std::sync::Arc<ServiceInstance>> {
        let entry = self.services.get(name)?;
        let instances = entry.instances.read().expect("lock poisoned");
        let healthy: Vec<_> = instances
            .iter()
            .filter(|i| i.status() == InstanceStatus::Healthy)
            .cloned()
            .collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = entry.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].clone())
    }

    /// Refresh `lastHeartbeatAt` for a known instance. No-op if unknown.
    pub fn heartbeat(&self, instance_id: &str) {
        for entry in self.services.iter() {
            let instances = entry.instances.read().expect("lock poisoned");
            if let Some(instance) = instances.iter().find(|i| i.id == instance_id) {
                instance.touch();
                return;
            }
        }
    }

    /// All service names with at least one instance ever registered.
    pub fn list_services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove every instance owned by `session_id` — called when a session
    /// transitions to CLOSED.
    pub fn purge_session(&self, session_id: &str) {
        for entry in self.services.iter() {
            let mut instances = entry.instances.write().expect("lock poisoned");
            instances.retain(|i| i.session_id != session_id);
        }
    }

    /// Mark-and-remove instances whose heartbeat is older than `expiry`.
    /// Run periodically by a background sweep; never called on the hot path.
    pub fn sweep_expired(&self, expiry: std::time::Duration) {
        let now = Instant::now();
        for entry in self.services.iter() {
            let mut instances = entry.instances.write().expect("lock poisoned");
            for instance in instances.iter() {
                if now.saturating_duration_since(instance.last_heartbeat_at()) > expiry {
                    instance.expire();
                }
            }
            instances.retain(|i| i.status() == InstanceStatus::Healthy);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
