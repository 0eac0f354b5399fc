use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared_types::{StatusRequest, WorkerId, WorkerStatus};
use tracing::{error, info};

use crate::auth::secrets_match;
use crate::error::RelayError;
use crate::pending::PendingTable;
use crate::registry::{ConnectionRegistry, CredentialStore, WorkerSnapshot};

/// Owner of the relay's shared state: the connection registry, the
/// credential store and the pending-request table.
pub struct RelayHub {
    pub connections: ConnectionRegistry,
    pub credentials: CredentialStore,
    pub pending: Arc<PendingTable>,
    request_timeout: Duration,
}

impl RelayHub {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connections: ConnectionRegistry::new(),
            credentials: CredentialStore::new(),
            pending: Arc::new(PendingTable::new()),
            request_timeout,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Read-only view over the registries for client tooling.
    pub fn status(&self, request: &StatusRequest) -> Result<WorkerStatus, RelayError> {
        let worker_id = request
            .worker_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(WorkerId::from)
            .ok_or(RelayError::MissingCredentials)?;

        let connected = self
            .connections
            .get(&worker_id)
            .map(|h| h.is_open())
            .unwrap_or(false);
        let credential = self.credentials.get(&worker_id);
        let credentials_valid = match (&credential, request.caller_secret.as_deref()) {
            (Some(c), Some(secret)) => secrets_match(secret, &c.secret),
            _ => false,
        };

        let mut status = WorkerStatus {
            worker_id: worker_id.to_string(),
            connected,
            registered: credential.is_some(),
            credentials_valid,
            ..WorkerStatus::default()
        };

        if let (true, Some(c)) = (credentials_valid, credential) {
            status.display_name = c.display_name;
            status.endpoint = c.endpoint;
            status.model = c.model;
            status.capabilities = c.capabilities.into_iter().collect();
            status.version = c.version;
            status.last_heartbeat = Some(c.last_heartbeat);
        }

        Ok(status)
    }

    /// Snapshot of all known workers for the admin endpoint.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Utc::now();
        let mut out: Vec<WorkerSnapshot> = self
            .credentials
            .worker_ids()
            .into_iter()
            .filter_map(|worker_id| {
                let credential = self.credentials.get(&worker_id)?;
                let connection = self.connections.get(&worker_id);
                Some(WorkerSnapshot {
                    worker_id: worker_id.to_string(),
                    connected: connection.is_some(),
                    connected_at: connection.map(|c| c.connected_at),
                    display_name: credential.display_name,
                    endpoint: credential.endpoint,
                    model: credential.model,
                    capabilities: credential.capabilities.into_iter().collect(),
                    version: credential.version,
                    registered_at: credential.registered_at,
                    last_heartbeat: credential.last_heartbeat,
                    idle_secs: now
                        .signed_duration_since(credential.last_heartbeat)
                        .num_seconds(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    /// Purge credentials of disconnected workers idle for longer than `ttl`.
    pub fn purge_expired_credentials(&self, ttl: Duration) -> usize {
        let purged = self
            .credentials
            .purge_expired(ttl, Utc::now(), |id| self.connections.contains(id));
        for worker_id in &purged {
            info!(worker_id = %worker_id, "credential expired");
        }
        purged.len()
    }

    /// Background task: purge expired credentials every `period`.
    pub async fn run_credential_expiry(self: Arc<Self>, ttl: Duration, period: Duration) {
        if period.is_zero() {
            error!("credential sweep interval is zero; credential expiry disabled");
            return;
        }
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            let purged = self.purge_expired_credentials(ttl);
            if purged > 0 {
                info!(purged, "credential sweep finished");
            }
        }
    }
}
