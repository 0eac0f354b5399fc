//! Push-channel ingress for local proxy workers.
//!
//! Authentication happens on the upgrade request (broker secret plus claimed
//! identity in headers). Each accepted socket then runs a [`ChannelSession`]:
//!
//! ```text
//! (upgrade accepted) → Unregistered ──register ok──→ Registered
//!                           │                           │
//!                           └──register mismatch──→ Closed ←── socket closed
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use shared_types::{
    AiResponsePayload, Envelope, EnvelopeType, ErrorPayload, RegisterAckPayload, RegisterPayload,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{check_broker_secret, secrets_match, ChannelMetadata};
use crate::error::RelayError;
use crate::hub::RelayHub;
use crate::pending::{Resolution, ResolveOutcome};
use crate::registry::{
    ConnectionHandle, Credential, Outbound, CLOSE_REGISTRATION_REJECTED, CLOSE_SUPERSEDED,
};
use crate::AppState;

/// How long the writer may keep flushing queued frames after the reader ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Worker-reported error messages are cut to this many characters.
const MAX_WORKER_ERROR_CHARS: usize = 500;

/// GET /ws/local-proxy
pub async fn channel_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(e) = check_broker_secret(&headers, state.config.broker_secret.as_deref()) {
        warn!(error = %e, "rejected local proxy channel");
        return e.into_response();
    }

    let metadata = match ChannelMetadata::from_headers(&headers) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "rejected local proxy channel: bad connection metadata");
            return e.into_response();
        }
    };

    // A retained credential can only be reclaimed with the secret it was registered with.
    if let Some(existing) = state.hub.credentials.get(&metadata.worker_id) {
        if !secrets_match(&metadata.worker_secret, &existing.secret) {
            warn!(
                worker_id = %metadata.worker_id,
                "rejected local proxy channel: secret differs from registered credential"
            );
            return RelayError::InvalidCredentials {
                worker_id: metadata.worker_id,
            }
            .into_response();
        }
    }

    info!(worker_id = %metadata.worker_id, "local proxy channel accepted");
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| run_channel(socket, hub, metadata))
}

async fn run_channel(socket: WebSocket, hub: Arc<RelayHub>, metadata: ChannelMetadata) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Envelope(envelope) => {
                    let text = match envelope.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!(error = %e, "failed to serialize envelope");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut session = ChannelSession::open(hub, metadata, ConnectionHandle::new(tx));

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if session.handle_text(text.as_str()) == Flow::Close {
                    break;
                }
            }
            Ok(Message::Close(reason)) => {
                debug!(worker_id = %session.worker_id(), reason = ?reason, "worker closed channel");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(worker_id = %session.worker_id(), error = %e, "channel read error");
                break;
            }
        }
    }

    session.close();
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Transport authenticated; waiting for `register`.
    Unregistered,
    Registered,
    Closed,
}

/// Whether the reader loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// State machine for one authenticated worker socket.
pub struct ChannelSession {
    hub: Arc<RelayHub>,
    metadata: ChannelMetadata,
    handle: ConnectionHandle,
    state: ChannelState,
}

impl ChannelSession {
    /// Enter the connection registry, evicting any previous socket for the same worker.
    pub fn open(hub: Arc<RelayHub>, metadata: ChannelMetadata, handle: ConnectionHandle) -> Self {
        if let Some(previous) = hub
            .connections
            .put(metadata.worker_id.clone(), handle.clone())
        {
            warn!(
                worker_id = %metadata.worker_id,
                previous_connection = %previous.connection_id,
                connection_id = %handle.connection_id,
                "replacing existing channel for worker"
            );
            previous.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
        }

        Self {
            hub,
            metadata,
            handle,
            state: ChannelState::Unregistered,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn worker_id(&self) -> &shared_types::WorkerId {
        &self.metadata.worker_id
    }

    pub fn handle_text(&mut self, text: &str) -> Flow {
        if self.state == ChannelState::Closed {
            return Flow::Close;
        }
        match Envelope::from_json(text) {
            Ok(envelope) => self.handle(envelope),
            Err(e) => {
                warn!(worker_id = %self.worker_id(), error = %e, "malformed envelope");
                self.reply(Envelope::failure(EnvelopeType::Error, "malformed envelope"));
                Flow::Continue
            }
        }
    }

    pub fn handle(&mut self, envelope: Envelope) -> Flow {
        use ChannelState::*;
        use EnvelopeType as T;

        match (self.state, envelope.kind) {
            (Closed, _) => Flow::Close,
            (_, T::Unknown) => {
                debug!(worker_id = %self.worker_id(), id = %envelope.id, "ignoring unknown envelope type");
                Flow::Continue
            }
            (Unregistered | Registered, T::Register) => self.on_register(envelope),
            (Registered, T::Heartbeat) => self.on_heartbeat(),
            (Registered, T::AiResponse | T::Error) => self.on_result(envelope),
            (Unregistered, T::Heartbeat | T::AiResponse | T::Error) => {
                warn!(
                    worker_id = %self.worker_id(),
                    kind = %envelope.kind,
                    "envelope received before registration"
                );
                self.reply(Envelope::failure(
                    EnvelopeType::Error,
                    format!("register before sending {}", envelope.kind),
                ));
                Flow::Continue
            }
            (_, T::RegisterAck | T::RegisterError | T::HeartbeatAck | T::AiRequest) => {
                debug!(
                    worker_id = %self.worker_id(),
                    kind = %envelope.kind,
                    "ignoring relay-bound envelope type from worker"
                );
                Flow::Continue
            }
        }
    }

    /// Leave the connection registry. Credentials are retained.
    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
        let removed = self
            .hub
            .connections
            .remove_if_current(&self.metadata.worker_id, self.handle.connection_id);
        info!(
            worker_id = %self.worker_id(),
            connection_id = %self.handle.connection_id,
            removed,
            "local proxy channel closed"
        );
    }

    fn on_register(&mut self, envelope: Envelope) -> Flow {
        let payload: RegisterPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "unparseable register payload");
                return self.reject_registration("malformed register payload");
            }
        };

        if payload.worker_id != self.metadata.worker_id
            || !secrets_match(&payload.secret, &self.metadata.worker_secret)
        {
            return self.reject_registration("workerId/secret do not match connection credentials");
        }

        let now = Utc::now();
        let credential = Credential {
            secret: payload.secret,
            display_name: payload
                .display_name
                .or_else(|| self.metadata.display_name.clone()),
            endpoint: payload.endpoint,
            model: payload.model,
            capabilities: payload.capabilities.into_iter().collect::<BTreeSet<_>>(),
            version: payload.version,
            registered_at: now,
            last_heartbeat: now,
        };
        let refreshed = self
            .hub
            .credentials
            .upsert(self.metadata.worker_id.clone(), credential)
            .is_some();
        self.state = ChannelState::Registered;
        self.handle.mark_registered();
        info!(
            worker_id = %self.worker_id(),
            connection_id = %self.handle.connection_id,
            refreshed,
            "local proxy worker registered"
        );

        match Envelope::with_payload(
            EnvelopeType::RegisterAck,
            &RegisterAckPayload {
                worker_id: self.metadata.worker_id.clone(),
                message: "registered".to_string(),
            },
        ) {
            Ok(ack) => self.reply(ack),
            Err(e) => error!(error = %e, "failed to build register_ack"),
        }
        Flow::Continue
    }

    fn reject_registration(&mut self, reason: &str) -> Flow {
        warn!(
            worker_id = %self.worker_id(),
            error = %RelayError::RegistrationMismatch(reason.to_string()),
            "registration rejected"
        );
        self.reply(Envelope::failure(EnvelopeType::RegisterError, reason));
        self.handle
            .close(CLOSE_REGISTRATION_REJECTED, "registration rejected");
        self.state = ChannelState::Closed;
        Flow::Close
    }

    fn on_heartbeat(&mut self) -> Flow {
        match self.hub.credentials.touch_heartbeat(&self.metadata.worker_id) {
            Some(at) => debug!(worker_id = %self.worker_id(), last_heartbeat = %at, "heartbeat"),
            None => warn!(worker_id = %self.worker_id(), "heartbeat for worker without credential"),
        }
        self.reply(Envelope::heartbeat_ack());
        Flow::Continue
    }

    fn on_result(&mut self, envelope: Envelope) -> Flow {
        let worker_id = self.metadata.worker_id.clone();
        let Some(credential) = self.hub.credentials.get(&worker_id) else {
            warn!(worker_id = %worker_id, "result from worker without credential");
            self.reply(Envelope::failure(EnvelopeType::Error, "worker is not registered"));
            return Flow::Continue;
        };

        let authentic = envelope
            .secret
            .as_deref()
            .map(|s| secrets_match(s, &credential.secret))
            .unwrap_or(false);
        if !authentic {
            warn!(
                worker_id = %worker_id,
                kind = %envelope.kind,
                correlation_id = ?envelope.correlation_id,
                "dropping result with invalid worker secret"
            );
            self.reply(Envelope::failure(EnvelopeType::Error, "invalid worker secret"));
            return Flow::Continue;
        }

        let Some(correlation_id) = envelope.correlation_id.clone() else {
            warn!(worker_id = %worker_id, kind = %envelope.kind, "result without correlationId");
            self.reply(Envelope::failure(EnvelopeType::Error, "missing correlationId"));
            return Flow::Continue;
        };

        let resolution = if envelope.kind == EnvelopeType::AiResponse {
            match envelope.payload_as::<AiResponsePayload>() {
                Ok(response) => Resolution::Completed(response),
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "malformed ai_response payload");
                    Resolution::Failed {
                        message: "local proxy returned a malformed response".to_string(),
                    }
                }
            }
        } else {
            let raw = envelope
                .payload_as::<ErrorPayload>()
                .map(|p| p.error)
                .unwrap_or_default();
            Resolution::Failed {
                message: sanitize_worker_message(&raw, &credential.secret),
            }
        };

        match self
            .hub
            .pending
            .resolve_for_worker(&worker_id, &correlation_id, resolution)
        {
            ResolveOutcome::Resolved => {
                debug!(worker_id = %worker_id, correlation_id = %correlation_id, kind = %envelope.kind, "pending request resolved");
            }
            ResolveOutcome::Unknown => {
                info!(
                    worker_id = %worker_id,
                    correlation_id = %correlation_id,
                    "no pending request for result (timed out or duplicate); dropping"
                );
            }
            ResolveOutcome::NotOwned => {
                warn!(
                    worker_id = %worker_id,
                    correlation_id = %correlation_id,
                    "worker attempted to resolve another worker's request"
                );
            }
        }
        Flow::Continue
    }

    fn reply(&self, envelope: Envelope) {
        if self.handle.send(envelope).is_err() {
            debug!(worker_id = %self.worker_id(), "channel writer gone; reply dropped");
        }
    }
}

/// Make a worker-reported error safe to hand back to an HTTP caller.
pub fn sanitize_worker_message(message: &str, secret: &str) -> String {
    let redacted = if secret.is_empty() {
        message.to_string()
    } else {
        message.replace(secret, "[redacted]")
    };
    let cleaned: String = redacted
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return "local proxy worker reported an error".to_string();
    }
    trimmed.chars().take(MAX_WORKER_ERROR_CHARS).collect()
}
