use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use shared_types::{Envelope, WorkerId};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Close code sent to a socket replaced by a newer connection for the same worker.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code sent after a rejected registration handshake.
pub const CLOSE_REGISTRATION_REJECTED: u16 = 4401;

/// Frames queued for a channel's writer task.
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

/// The writer task for this connection has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

/// Transient handle to a worker's live push channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Outbound>,
    /// Set once this socket has completed `register`; shared by all clones.
    registered: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            tx,
            registered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// True once this socket, not merely this worker id, has registered.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.tx
            .send(Outbound::Envelope(envelope))
            .map_err(|_| ChannelClosed)
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// worker_id → live channel handle
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<WorkerId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, returning the one it replaced.
    pub fn put(&self, worker_id: WorkerId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.entries.insert(worker_id, handle)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<ConnectionHandle> {
        self.entries.get(worker_id).map(|h| h.value().clone())
    }

    pub fn remove(&self, worker_id: &WorkerId) -> Option<ConnectionHandle> {
        self.entries.remove(worker_id).map(|(_, h)| h)
    }

    /// Remove the entry only if it still belongs to `connection_id`.
    pub fn remove_if_current(&self, worker_id: &WorkerId, connection_id: Uuid) -> bool {
        self.entries
            .remove_if(worker_id, |_, h| h.connection_id == connection_id)
            .is_some()
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.entries.contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registration record for a worker.
#[derive(Clone)]
pub struct Credential {
    pub secret: String,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"[redacted]")
            .field("display_name", &self.display_name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("capabilities", &self.capabilities)
            .field("version", &self.version)
            .field("registered_at", &self.registered_at)
            .field("last_heartbeat", &self.last_heartbeat)
            .finish()
    }
}

/// worker_id → registration record. Outlives transient disconnects.
#[derive(Default)]
pub struct CredentialStore {
    entries: DashMap<WorkerId, Credential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, worker_id: WorkerId, credential: Credential) -> Option<Credential> {
        self.entries.insert(worker_id, credential)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<Credential> {
        self.entries.get(worker_id).map(|c| c.value().clone())
    }

    /// Refresh `last_heartbeat`. Returns the new timestamp, or `None` if unknown.
    pub fn touch_heartbeat(&self, worker_id: &WorkerId) -> Option<DateTime<Utc>> {
        let mut entry = self.entries.get_mut(worker_id)?;
        let now = Utc::now();
        entry.last_heartbeat = now;
        Some(now)
    }

    pub fn remove(&self, worker_id: &WorkerId) -> Option<Credential> {
        self.entries.remove(worker_id).map(|(_, c)| c)
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.entries.contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop records whose last heartbeat is older than `ttl`, skipping
    /// workers for which `is_connected` returns true.
    pub fn purge_expired(
        &self,
        ttl: Duration,
        now: DateTime<Utc>,
        is_connected: impl Fn(&WorkerId) -> bool,
    ) -> Vec<WorkerId> {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let expired: Vec<WorkerId> = self
            .entries
            .iter()
            .filter(|e| now.signed_duration_since(e.last_heartbeat) > ttl)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| !is_connected(id))
            .filter(|id| {
                self.entries
                    .remove_if(id, |_, c| now.signed_duration_since(c.last_heartbeat) > ttl)
                    .is_some()
            })
            .collect()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

/// Admin view of one worker. Never includes the secret.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub idle_secs: i64,
}
