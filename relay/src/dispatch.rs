//! HTTP ingress: hand an AI request to a worker and wait for its reply.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use shared_types::{
    AiRequestPayload, AiResponsePayload, DispatchRequest, DispatchResponse, Envelope,
    EnvelopeType, WorkerId,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::secrets_match;
use crate::error::RelayError;
use crate::hub::RelayHub;
use crate::pending::{PendingGuard, Resolution};
use crate::AppState;

impl RelayHub {
    /// Validate the target worker, forward an `ai_request` envelope and
    /// suspend until the worker answers, errors, or the deadline passes.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<AiResponsePayload, RelayError> {
        let DispatchRequest {
            action,
            payload,
            worker_id,
            caller_secret,
        } = request;

        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let (Some(worker_id), Some(caller_secret)) = (non_empty(worker_id), non_empty(caller_secret))
        else {
            return Err(RelayError::MissingCredentials);
        };
        let worker_id = WorkerId::from(worker_id);

        let connection = self
            .connections
            .get(&worker_id)
            .ok_or_else(|| RelayError::NotConnected {
                worker_id: worker_id.clone(),
            })?;
        // Credentials outlive sockets; a reconnected socket must re-register first.
        if !connection.is_registered() {
            return Err(RelayError::NotRegistered { worker_id });
        }
        let credential = self
            .credentials
            .get(&worker_id)
            .ok_or_else(|| RelayError::NotRegistered {
                worker_id: worker_id.clone(),
            })?;
        if !secrets_match(&caller_secret, &credential.secret) {
            warn!(worker_id = %worker_id, "dispatch rejected: caller secret mismatch");
            return Err(RelayError::InvalidCredentials { worker_id });
        }

        let timeout = self.request_timeout();
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;
        let (correlation_id, rx) = self.pending.insert(worker_id.clone(), deadline);
        let _guard = PendingGuard::arm(Arc::clone(&self.pending), correlation_id.clone(), deadline);

        let envelope = Envelope::with_payload(
            EnvelopeType::AiRequest,
            &AiRequestPayload {
                action: action.clone(),
                payload,
            },
        )
        .map_err(|e| RelayError::ProtocolError(e.to_string()))?
        .correlated(correlation_id.clone());

        if connection.send(envelope).is_err() {
            self.pending.cancel(&correlation_id);
            warn!(
                worker_id = %worker_id,
                correlation_id = %correlation_id,
                "channel closed before ai_request could be written"
            );
            return Err(RelayError::DispatchFailed { worker_id });
        }

        info!(
            worker_id = %worker_id,
            correlation_id = %correlation_id,
            action = %action,
            timeout_ms,
            "ai_request dispatched"
        );

        match rx.await {
            Ok(Resolution::Completed(response)) => {
                debug!(correlation_id = %correlation_id, "ai_response delivered");
                Ok(response)
            }
            Ok(Resolution::Failed { message }) => Err(RelayError::UpstreamError { worker_id, message }),
            Ok(Resolution::TimedOut) => Err(RelayError::Timeout {
                worker_id,
                timeout_ms,
            }),
            // Sender dropped without a resolution: the entry was cancelled.
            Err(_) => Err(RelayError::DispatchFailed { worker_id }),
        }
    }
}

/// POST /api/local-proxy/dispatch
pub async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> Result<Json<DispatchResponse>, RelayError> {
    let Json(request) = payload?;
    let response = state.hub.dispatch(request).await?;
    Ok(Json(DispatchResponse::from(response)))
}
