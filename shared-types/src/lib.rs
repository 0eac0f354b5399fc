//! Shared types between the relay and local proxy workers
//!
//! These types are used by both:
//! - the relay (push-channel router and HTTP dispatch)
//! - the local proxy worker (channel client)
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ============================================================================
// Channel Metadata
// ============================================================================

/// Well-known path of the push-channel endpoint.
pub const CHANNEL_PATH: &str = "/ws/local-proxy";

/// Connection metadata headers presented on the channel upgrade request.
/// The broker secret travels as `Authorization: Bearer <secret>`.
pub const WORKER_ID_HEADER: &str = "x-relay-worker-id";
pub const WORKER_SECRET_HEADER: &str = "x-relay-worker-secret";
pub const WORKER_NAME_HEADER: &str = "x-relay-worker-name";

// ============================================================================
// Core Types
// ============================================================================

/// Stable identity chosen by a worker at first run (a UUID string).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is a well-formed UUID.
    pub fn is_valid(&self) -> bool {
        uuid::Uuid::parse_str(&self.0).is_ok()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Envelope kinds exchanged over the push channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Register,
    RegisterAck,
    RegisterError,
    Heartbeat,
    HeartbeatAck,
    AiRequest,
    AiResponse,
    Error,
    /// Any type this build does not know about. Receivers log and ignore it.
    #[serde(other)]
    Unknown,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Register => "register",
            EnvelopeType::RegisterAck => "register_ack",
            EnvelopeType::RegisterError => "register_error",
            EnvelopeType::Heartbeat => "heartbeat",
            EnvelopeType::HeartbeatAck => "heartbeat_ack",
            EnvelopeType::AiRequest => "ai_request",
            EnvelopeType::AiResponse => "ai_response",
            EnvelopeType::Error => "error",
            EnvelopeType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire unit exchanged over the channel in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,

    /// Unique envelope id (UUID v4)
    pub id: String,

    pub timestamp: DateTime<Utc>,

    /// Set on `ai_request`, `ai_response` and request-scoped `error` envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Worker secret, required on privileged worker → relay envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Shape depends on `kind`
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Envelope {
    pub fn new(kind: EnvelopeType, payload: serde_json::Value) -> Self {
        Self {
            kind,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            correlation_id: None,
            secret: None,
            payload,
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn with_payload<T: Serialize>(
        kind: EnvelopeType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn signed(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn heartbeat() -> Self {
        Self::new(EnvelopeType::Heartbeat, empty_payload())
    }

    pub fn heartbeat_ack() -> Self {
        Self::new(EnvelopeType::HeartbeatAck, empty_payload())
    }

    /// `error`-family envelope carrying `{ "error": message }`.
    pub fn failure(kind: EnvelopeType, message: impl Into<String>) -> Self {
        Self::new(kind, serde_json::json!({ "error": message.into() }))
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ============================================================================
// Envelope Payloads
// ============================================================================

/// `register` payload: the worker's identity and display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub worker_id: WorkerId,
    pub secret: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Human-readable description of the local backend endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    pub worker_id: WorkerId,
    pub message: String,
}

/// `ai_request` payload. The relay forwards it verbatim and never inspects `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiRequestPayload {
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// `ai_response` payload produced by the worker's local backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiResponsePayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
}

/// `error` / `register_error` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    #[serde(alias = "message")]
    pub error: String,
}

// ============================================================================
// HTTP API Types
// ============================================================================

/// Body of `POST /api/local-proxy/dispatch`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub caller_secret: Option<String>,
}

/// Successful dispatch result returned to the HTTP caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
}

impl From<AiResponsePayload> for DispatchResponse {
    fn from(value: AiResponsePayload) -> Self {
        Self {
            text: value.content,
            description: value.description,
            model: value.model,
            structured: value.structured,
        }
    }
}

/// Body of `POST /api/local-proxy/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub caller_secret: Option<String>,
}

/// Read-only view of a worker's relay state.
/// Display metadata is only filled in when the caller's secret is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub worker_id: String,
    pub connected: bool,
    pub registered: bool,
    pub credentials_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// JSON body of every relay failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Tests
// ============================================================================
