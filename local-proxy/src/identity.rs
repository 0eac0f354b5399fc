//! Persistent worker identity.
//!
//! The relay keys credentials by worker id, so the id and secret must
//! survive restarts. Both live in a small JSON file created on first run.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::WorkerId;
use tracing::info;

use crate::error::WorkerError;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub worker_id: WorkerId,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerIdentity")
            .field("worker_id", &self.worker_id)
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl WorkerIdentity {
    /// Fresh v4 worker id plus a random 32-byte hex secret.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        Self {
            worker_id: WorkerId::new(),
            secret: hex::encode(raw),
            created_at: Utc::now(),
        }
    }

    /// Read the identity at `path`, creating it on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, WorkerError> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| WorkerError::Identity(format!("{}: {e}", path.display())))?;
            let identity: WorkerIdentity = serde_json::from_str(&raw)
                .map_err(|e| WorkerError::Identity(format!("{}: {e}", path.display())))?;
            if !identity.worker_id.is_valid() || identity.secret.trim().is_empty() {
                return Err(WorkerError::Identity(format!(
                    "{}: worker id must be a UUID and secret must be non-empty",
                    path.display()
                )));
            }
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(
            worker_id = %identity.worker_id,
            path = %path.display(),
            "created new local proxy identity"
        );
        Ok(identity)
    }

    fn save(&self, path: &Path) -> Result<(), WorkerError> {
        let io_err = |e: std::io::Error| WorkerError::Identity(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }
        Ok(())
    }
}
