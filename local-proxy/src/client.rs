//! Outbound channel to the relay.
//!
//! One connection attempt is: open the WebSocket with credentials in the
//! upgrade headers, send `register`, wait for `register_ack`, then serve
//! `ai_request`s and send heartbeats until the channel goes away. The
//! supervisor wraps attempts in an exponential-backoff reconnect loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use shared_types::{
    AiRequestPayload, Envelope, EnvelopeType, ErrorPayload, RegisterPayload, CHANNEL_PATH,
    WORKER_ID_HEADER, WORKER_NAME_HEADER, WORKER_SECRET_HEADER,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, handshake::client::Request, http::HeaderValue, Message,
};
use tracing::{debug, error, info, warn};

use crate::backend::CompletionBackend;
use crate::backoff::ReconnectPolicy;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::identity::WorkerIdentity;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a registered connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Relay sent a close frame or the stream ended.
    Closed,
    /// Socket failed after registration (reset, relay restart).
    Dropped,
    /// Too many consecutive heartbeats could not be written.
    HeartbeatLost { missed: u32 },
}

/// What an in-flight request needs to produce a signed reply.
struct RequestContext {
    secret: String,
    backend: Arc<dyn CompletionBackend>,
}

pub struct LocalProxy {
    config: WorkerConfig,
    identity: WorkerIdentity,
    backend: Arc<dyn CompletionBackend>,
}

impl LocalProxy {
    pub fn new(
        config: WorkerConfig,
        identity: WorkerIdentity,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            config,
            identity,
            backend,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Keep a channel open until a fatal error or reconnect exhaustion.
    pub async fn run(&self) -> WorkerError {
        supervise(&self.config.reconnect, || self.connect_and_run()).await
    }

    /// A single connection attempt: connect, register, serve until disconnect.
    pub async fn connect_and_run(&self) -> Result<Disconnect, WorkerError> {
        let request = self.channel_request()?;
        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(tungstenite::Error::Http(response)) => {
                return Err(WorkerError::HandshakeRejected {
                    status: response.status().as_u16(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let (mut sink, mut stream) = ws.split();
        info!(worker_id = %self.identity.worker_id, "connected to relay, registering");

        let register = Envelope::with_payload(EnvelopeType::Register, &self.register_payload())?;
        sink.send(Message::Text(register.to_json()?)).await?;
        tokio::time::timeout(REGISTRATION_TIMEOUT, await_registration(&mut stream))
            .await
            .map_err(|_| WorkerError::RegistrationTimeout)??;
        info!(worker_id = %self.identity.worker_id, "registered with relay");

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_envelopes(sink, rx));
        let ctx = Arc::new(RequestContext {
            secret: self.identity.secret.clone(),
            backend: Arc::clone(&self.backend),
        });

        let result = run_session(
            stream,
            tx,
            ctx,
            self.config.heartbeat_interval,
            self.config.max_missed_heartbeats,
        )
        .await;
        writer.abort();
        result
    }

    fn channel_request(&self) -> Result<Request, WorkerError> {
        let base = self.config.relay_url.trim_end_matches('/');
        let url = if base.ends_with(CHANNEL_PATH) {
            base.to_string()
        } else {
            format!("{base}{CHANNEL_PATH}")
        };
        let mut request = url.into_client_request()?;

        let header = |value: &str| {
            HeaderValue::from_str(value).map_err(|_| {
                WorkerError::Config("channel credentials must be visible ASCII".to_string())
            })
        };
        let headers = request.headers_mut();
        headers.insert(
            "authorization",
            header(&format!("Bearer {}", self.config.broker_secret))?,
        );
        headers.insert(WORKER_ID_HEADER, header(self.identity.worker_id.as_str())?);
        headers.insert(WORKER_SECRET_HEADER, header(&self.identity.secret)?);
        if let Some(name) = &self.config.display_name {
            headers.insert(WORKER_NAME_HEADER, header(name)?);
        }
        Ok(request)
    }

    fn register_payload(&self) -> RegisterPayload {
        RegisterPayload {
            worker_id: self.identity.worker_id.clone(),
            secret: self.identity.secret.clone(),
            display_name: self.config.display_name.clone(),
            endpoint: Some(self.backend.endpoint()),
            model: self.backend.model(),
            capabilities: vec!["chat".to_string()],
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

/// Reconnect loop around `connect`.
///
/// A connection that reached `registered` resets the backoff. Fatal errors
/// end the loop immediately; otherwise it ends once the policy's attempts
/// are used up.
pub async fn supervise<F, Fut>(policy: &ReconnectPolicy, mut connect: F) -> WorkerError
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Disconnect, WorkerError>>,
{
    let mut backoff = policy.backoff();
    loop {
        match connect().await {
            Ok(reason) => {
                info!(reason = ?reason, "channel ended");
                backoff.reset();
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal channel error");
                return e;
            }
            Err(e) => warn!(error = %e, attempt = backoff.attempts(), "channel attempt failed"),
        }

        let Some(delay) = backoff.next_delay() else {
            let attempts = backoff.attempts();
            error!(attempts, "reconnect attempts exhausted");
            return WorkerError::ReconnectExhausted { attempts };
        };
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempts(),
            "reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Wait for `register_ack`; `register_error` is fatal.
async fn await_registration<S>(stream: &mut S) -> Result<(), WorkerError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => return Err(WorkerError::ChannelClosed),
            _ => continue,
        };
        let envelope = match Envelope::from_json(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed envelope from relay");
                continue;
            }
        };
        match envelope.kind {
            EnvelopeType::RegisterAck => return Ok(()),
            EnvelopeType::RegisterError => return Err(registration_rejected(&envelope)),
            other => debug!(kind = %other, "ignoring envelope before register_ack"),
        }
    }
    Err(WorkerError::ChannelClosed)
}

fn registration_rejected(envelope: &Envelope) -> WorkerError {
    let reason = envelope
        .payload_as::<ErrorPayload>()
        .map(|p| p.error)
        .unwrap_or_else(|_| "registration rejected".to_string());
    WorkerError::RegistrationRejected(reason)
}

/// Serialize queued envelopes onto the socket. Exits on the first failed
/// write, which makes every later send on the queue fail.
async fn write_envelopes<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Envelope>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let text = match envelope.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to serialize envelope");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!(error = %e, "channel write failed");
            break;
        }
    }
}

async fn run_session<S>(
    mut inbound: S,
    outbound: mpsc::UnboundedSender<Envelope>,
    ctx: Arc<RequestContext>,
    heartbeat_interval: Duration,
    max_missed_heartbeats: u32,
) -> Result<Disconnect, WorkerError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut monitor = HeartbeatMonitor::new(max_missed_heartbeats);
    // Dropping the set aborts requests still waiting on the backend.
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            frame = inbound.next() => {
                let text = match frame {
                    None => return Ok(Disconnect::Closed),
                    Some(Err(e)) => {
                        warn!(error = %e, "channel read failed");
                        return Ok(Disconnect::Dropped);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "relay closed channel");
                        return Ok(Disconnect::Closed);
                    }
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                handle_frame(&text, &outbound, &ctx, &mut in_flight)?;
            }
            _ = ticker.tick() => {
                if outbound.send(Envelope::heartbeat()).is_ok() {
                    monitor.record_sent();
                } else if monitor.record_missed() == HeartbeatVerdict::Abandon {
                    warn!(missed = monitor.missed(), "heartbeats undeliverable; abandoning connection");
                    return Ok(Disconnect::HeartbeatLost { missed: monitor.missed() });
                } else {
                    debug!(missed = monitor.missed(), "heartbeat not sent; channel not writable");
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "ai_request task panicked");
                    }
                }
            }
        }
    }
}

fn handle_frame(
    text: &str,
    outbound: &mpsc::UnboundedSender<Envelope>,
    ctx: &Arc<RequestContext>,
    in_flight: &mut JoinSet<()>,
) -> Result<(), WorkerError> {
    let envelope = match Envelope::from_json(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed envelope from relay");
            return Ok(());
        }
    };

    match envelope.kind {
        EnvelopeType::AiRequest => {
            let Some(correlation_id) = envelope.correlation_id.clone() else {
                warn!("ai_request without correlationId");
                return Ok(());
            };
            match envelope.payload_as::<AiRequestPayload>() {
                Ok(request) => {
                    in_flight.spawn(serve_request(
                        Arc::clone(ctx),
                        correlation_id,
                        request,
                        outbound.clone(),
                    ));
                }
                Err(e) => {
                    warn!(correlation_id = %correlation_id, error = %e, "invalid ai_request payload");
                    let reply = Envelope::failure(EnvelopeType::Error, "invalid ai_request payload")
                        .correlated(correlation_id)
                        .signed(ctx.secret.clone());
                    let _ = outbound.send(reply);
                }
            }
        }
        EnvelopeType::HeartbeatAck => debug!("heartbeat acknowledged"),
        EnvelopeType::Error => {
            let message = envelope
                .payload_as::<ErrorPayload>()
                .map(|p| p.error)
                .unwrap_or_default();
            warn!(error = %message, "relay reported an error");
        }
        EnvelopeType::RegisterError => return Err(registration_rejected(&envelope)),
        other => debug!(kind = %other, "ignoring envelope"),
    }
    Ok(())
}

async fn serve_request(
    ctx: Arc<RequestContext>,
    correlation_id: String,
    request: AiRequestPayload,
    outbound: mpsc::UnboundedSender<Envelope>,
) {
    let started = Instant::now();
    debug!(correlation_id = %correlation_id, action = %request.action, "serving ai_request");

    let reply = match ctx.backend.complete(&request).await {
        Ok(response) => Envelope::with_payload(EnvelopeType::AiResponse, &response)
            .unwrap_or_else(|e| {
                Envelope::failure(EnvelopeType::Error, format!("failed to encode response: {e}"))
            }),
        Err(e) => {
            warn!(correlation_id = %correlation_id, error = %e, "backend request failed");
            Envelope::failure(EnvelopeType::Error, e.to_string())
        }
    };
    let kind = reply.kind;
    let reply = reply
        .correlated(correlation_id.clone())
        .signed(ctx.secret.clone());

    if outbound.send(reply).is_err() {
        warn!(correlation_id = %correlation_id, "channel gone before reply could be sent");
    } else {
        info!(
            correlation_id = %correlation_id,
            kind = %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reply sent"
        );
    }
}
