//! Connection-metadata extraction and secret comparison.

use axum::http::{header, HeaderMap};
use shared_types::{WorkerId, WORKER_ID_HEADER, WORKER_NAME_HEADER, WORKER_SECRET_HEADER};
use subtle::ConstantTimeEq;

use crate::error::RelayError;

/// Constant-time secret comparison.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// `Authorization: Bearer <token>`, trimmed. Empty when absent.
pub fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default()
}

/// Reject unless the request carries the configured broker secret.
pub fn check_broker_secret(headers: &HeaderMap, expected: Option<&str>) -> Result<(), RelayError> {
    let Some(expected) = expected else {
        return Err(RelayError::BrokerNotConfigured);
    };
    let provided = bearer_token(headers);
    if provided.is_empty() || !secrets_match(provided, expected) {
        return Err(RelayError::BrokerUnauthorized);
    }
    Ok(())
}

/// Identity a channel claims out-of-band on its upgrade request.
#[derive(Debug, Clone)]
pub struct ChannelMetadata {
    pub worker_id: WorkerId,
    pub worker_secret: String,
    pub display_name: Option<String>,
}

impl ChannelMetadata {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RelayError> {
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };

        let (Some(worker_id), Some(worker_secret)) =
            (header_str(WORKER_ID_HEADER), header_str(WORKER_SECRET_HEADER))
        else {
            return Err(RelayError::MissingCredentials);
        };

        let worker_id = WorkerId::from(worker_id);
        if !worker_id.is_valid() {
            return Err(RelayError::ProtocolError(
                "worker id must be a UUID".to_string(),
            ));
        }

        Ok(Self {
            worker_id,
            worker_secret,
            display_name: header_str(WORKER_NAME_HEADER),
        })
    }
}
