use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shared_types::{ErrorBody, WorkerId};
use thiserror::Error;

/// Relay failures. Messages never include secret values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("workerId and callerSecret are required")]
    MissingCredentials,

    #[error("invalid credentials for local proxy worker {worker_id}")]
    InvalidCredentials { worker_id: WorkerId },

    #[error("local proxy worker {worker_id} is not currently connected")]
    NotConnected { worker_id: WorkerId },

    #[error("local proxy worker {worker_id} is connected but has not registered")]
    NotRegistered { worker_id: WorkerId },

    #[error("registration does not match connection metadata: {0}")]
    RegistrationMismatch(String),

    #[error("failed to dispatch request to local proxy worker {worker_id}")]
    DispatchFailed { worker_id: WorkerId },

    #[error("local proxy worker {worker_id} did not respond within {timeout_ms}ms")]
    Timeout { worker_id: WorkerId, timeout_ms: u64 },

    #[error("local proxy worker {worker_id} reported an error: {message}")]
    UpstreamError { worker_id: WorkerId, message: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("invalid broker credentials")]
    BrokerUnauthorized,

    #[error("local proxy channel is not configured on this relay")]
    BrokerNotConfigured,
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingCredentials | RelayError::ProtocolError(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::InvalidCredentials { .. }
            | RelayError::RegistrationMismatch(_)
            | RelayError::BrokerUnauthorized => StatusCode::UNAUTHORIZED,
            RelayError::NotConnected { .. }
            | RelayError::NotRegistered { .. }
            | RelayError::BrokerNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::DispatchFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            RelayError::InvalidCredentials { worker_id }
            | RelayError::NotConnected { worker_id }
            | RelayError::NotRegistered { worker_id }
            | RelayError::DispatchFailed { worker_id }
            | RelayError::Timeout { worker_id, .. }
            | RelayError::UpstreamError { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let timeout_ms = match self {
            RelayError::Timeout { timeout_ms, .. } => Some(*timeout_ms),
            _ => None,
        };
        ErrorBody {
            error: self.to_string(),
            worker_id: self.worker_id().map(ToString::to_string),
            timeout_ms,
        }
    }
}

/// Malformed request bodies become a 400 with the usual JSON error body.
/// Serde messages can quote field values, so only the category is reported.
impl From<JsonRejection> for RelayError {
    fn from(rejection: JsonRejection) -> Self {
        let detail = match rejection {
            JsonRejection::JsonDataError(_) => "request body has missing or mistyped fields",
            JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON",
            JsonRejection::MissingJsonContentType(_) => "expected `Content-Type: application/json`",
            _ => "request body could not be read",
        };
        RelayError::ProtocolError(detail.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_body_carries_diagnostics() {
        let err = RelayError::Timeout {
            worker_id: WorkerId::from("w-1"),
            timeout_ms: 1500,
        };
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = err.body();
        assert_eq!(body.worker_id.as_deref(), Some("w-1"));
        assert_eq!(body.timeout_ms, Some(1500));
        assert!(body.error.contains("1500ms"));
    }

    #[test]
    fn test_not_connected_message() {
        let err = RelayError::NotConnected {
            worker_id: WorkerId::from("W2"),
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().contains("not currently connected"));
    }
}
