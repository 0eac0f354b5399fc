//! Pending-request table: correlation id → suspended HTTP response.
//!
//! Each entry owns a `oneshot` sender. Removing the entry from the map is the
//! only way to reach the sender, so whichever of {worker reply, timeout,
//! caller abort} removes it first is the only one that can resolve it.

use std::sync::Arc;

use dashmap::DashMap;
use shared_types::{AiResponsePayload, WorkerId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a pending request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Completed(AiResponsePayload),
    Failed { message: String },
    TimedOut,
}

pub struct PendingRequest {
    pub correlation_id: String,
    pub worker_id: WorkerId,
    pub deadline: Instant,
    pub created_at: Instant,
    sink: oneshot::Sender<Resolution>,
}

/// Result of a worker's attempt to resolve a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// Already resolved, timed out, or never existed.
    Unknown,
    /// The entry belongs to a different worker and was left untouched.
    NotOwned,
}

#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<String, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh correlation id and insert an entry for it.
    pub fn insert(
        &self,
        worker_id: WorkerId,
        deadline: Instant,
    ) -> (String, oneshot::Receiver<Resolution>) {
        let (sink, rx) = oneshot::channel();
        let correlation_id = Uuid::new_v4().to_string();
        self.entries.insert(
            correlation_id.clone(),
            PendingRequest {
                correlation_id: correlation_id.clone(),
                worker_id,
                deadline,
                created_at: Instant::now(),
                sink,
            },
        );
        (correlation_id, rx)
    }

    /// Resolve and remove. Returns false if the entry was already gone.
    pub fn resolve(&self, correlation_id: &str, resolution: Resolution) -> bool {
        match self.entries.remove(correlation_id) {
            Some((_, entry)) => {
                deliver(entry, resolution);
                true
            }
            None => false,
        }
    }

    /// Resolve only if the entry was dispatched to `worker_id`.
    pub fn resolve_for_worker(
        &self,
        worker_id: &WorkerId,
        correlation_id: &str,
        resolution: Resolution,
    ) -> ResolveOutcome {
        match self
            .entries
            .remove_if(correlation_id, |_, entry| entry.worker_id == *worker_id)
        {
            Some((_, entry)) => {
                deliver(entry, resolution);
                ResolveOutcome::Resolved
            }
            None if self.entries.contains_key(correlation_id) => ResolveOutcome::NotOwned,
            None => ResolveOutcome::Unknown,
        }
    }

    /// Remove without resolving (caller abort or failed write).
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reply that lands after the deadline, ahead of the timer task, still
/// resolves as a timeout.
fn deliver(entry: PendingRequest, resolution: Resolution) {
    let now = Instant::now();
    let elapsed_ms = now.duration_since(entry.created_at).as_millis() as u64;
    let resolution = if now >= entry.deadline && resolution != Resolution::TimedOut {
        debug!(
            correlation_id = %entry.correlation_id,
            worker_id = %entry.worker_id,
            elapsed_ms,
            "reply arrived past deadline"
        );
        Resolution::TimedOut
    } else {
        resolution
    };
    let remaining_ms = entry.deadline.saturating_duration_since(now).as_millis() as u64;
    if entry.sink.send(resolution).is_err() {
        debug!(
            correlation_id = %entry.correlation_id,
            worker_id = %entry.worker_id,
            elapsed_ms,
            remaining_ms,
            "pending request resolved after its caller went away"
        );
    }
}

/// Deadline timer plus cleanup hook for one pending request.
///
/// The timer resolves the entry with [`Resolution::TimedOut`] at its
/// deadline. Dropping the guard (request finished, or the HTTP caller hung up
/// and the handler future was dropped) cancels the timer and removes the
/// entry if it is still present.
pub struct PendingGuard {
    table: Arc<PendingTable>,
    correlation_id: String,
    timer: JoinHandle<()>,
}

impl PendingGuard {
    pub fn arm(table: Arc<PendingTable>, correlation_id: String, deadline: Instant) -> Self {
        let timer = {
            let table = Arc::clone(&table);
            let correlation_id = correlation_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if table.resolve(&correlation_id, Resolution::TimedOut) {
                    warn!(correlation_id = %correlation_id, "pending request timed out");
                }
            })
        };
        Self {
            table,
            correlation_id,
            timer,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.timer.abort();
        if self.table.cancel(&self.correlation_id) {
            debug!(
                correlation_id = %self.correlation_id,
                "pending request abandoned by caller"
            );
        }
    }
}
