//! Relay channel + dispatch integration tests
//!
//! Starts a real relay on an ephemeral port, connects fake workers over
//! WebSocket and drives the HTTP dispatch endpoint with reqwest.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay::config::Config;
use relay::AppState;
use shared_types::{
    Envelope, EnvelopeType, WorkerId, CHANNEL_PATH, WORKER_ID_HEADER, WORKER_SECRET_HEADER,
};

const BROKER_SECRET: &str = "broker-test-secret";

type WorkerSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_test_server(request_timeout: Duration) -> TestServer {
    let config = Config {
        port: 0,
        broker_secret: Some(BROKER_SECRET.to_string()),
        request_timeout,
        ..Config::default()
    };
    let state = AppState::new(config);
    let app = relay::router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    TestServer {
        addr,
        state,
        handle,
    }
}

async fn connect_worker(
    addr: SocketAddr,
    broker_secret: Option<&str>,
    worker_id: &WorkerId,
    worker_secret: &str,
) -> Result<WorkerSocket, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}{CHANNEL_PATH}")
        .into_client_request()
        .expect("Invalid request");
    let headers = request.headers_mut();
    if let Some(secret) = broker_secret {
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {secret}")).unwrap(),
        );
    }
    headers.insert(
        WORKER_ID_HEADER,
        HeaderValue::from_str(worker_id.as_str()).unwrap(),
    );
    headers.insert(
        WORKER_SECRET_HEADER,
        HeaderValue::from_str(worker_secret).unwrap(),
    );
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn send_envelope(ws: &mut WorkerSocket, envelope: Envelope) {
    let text = envelope.to_json().expect("serialize envelope");
    ws.send(Message::Text(text)).await.expect("Send error");
}

/// Next envelope, or `None` once the relay closes the channel.
async fn try_recv_envelope(ws: &mut WorkerSocket) -> Option<Envelope> {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(Envelope::from_json(&text).expect("Invalid envelope"));
            }
            Ok(Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => panic!("Timeout waiting for frame"),
        }
    }
}

async fn recv_envelope(ws: &mut WorkerSocket) -> Envelope {
    try_recv_envelope(ws).await.expect("Connection closed")
}

async fn register_worker(addr: SocketAddr, worker_id: &WorkerId, secret: &str) -> WorkerSocket {
    let mut ws = connect_worker(addr, Some(BROKER_SECRET), worker_id, secret)
        .await
        .expect("Failed to connect worker");
    send_envelope(
        &mut ws,
        Envelope::new(
            EnvelopeType::Register,
            json!({
                "workerId": worker_id,
                "secret": secret,
                "displayName": "Test Worker",
                "model": "llama3",
                "capabilities": ["chat"],
                "version": "0.1.0",
            }),
        ),
    )
    .await;
    let ack = recv_envelope(&mut ws).await;
    assert_eq!(ack.kind, EnvelopeType::RegisterAck);
    ws
}

fn dispatch(
    addr: SocketAddr,
    worker_id: &WorkerId,
    caller_secret: &str,
) -> tokio::task::JoinHandle<(u16, Value)> {
    let url = format!("http://{addr}/api/local-proxy/dispatch");
    let body = json!({
        "action": "generate_task",
        "payload": {"prompt": "Plan the release"},
        "workerId": worker_id,
        "callerSecret": caller_secret,
    });
    tokio::spawn(async move {
        let response = reqwest::Client::new()
            .post(url)
            .json(&body)
            .send()
            .await
            .expect("request failed");
        let status = response.status().as_u16();
        let value: Value = response.json().await.expect("invalid json");
        (status, value)
    })
}

fn ai_response(correlation_id: &str, secret: &str, content: &str) -> Envelope {
    Envelope::new(EnvelopeType::AiResponse, json!({"content": content, "model": "llama3"}))
        .correlated(correlation_id)
        .signed(secret)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_dispatch_round_trip() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let mut ws = register_worker(server.addr, &worker_id, "w1-secret").await;

    let call = dispatch(server.addr, &worker_id, "w1-secret");

    let request = recv_envelope(&mut ws).await;
    assert_eq!(request.kind, EnvelopeType::AiRequest);
    assert_eq!(request.payload["action"], "generate_task");
    assert_eq!(request.payload["payload"]["prompt"], "Plan the release");
    let correlation_id = request.correlation_id.expect("missing correlation id");

    send_envelope(&mut ws, ai_response(&correlation_id, "w1-secret", "- [ ] Tag v1.0")).await;

    let (status, body) = call.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["text"], "- [ ] Tag v1.0");
    assert_eq!(body["model"], "llama3");
    assert!(server.state.hub.pending.is_empty());
}

#[tokio::test]
async fn test_dispatch_to_unconnected_worker() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let (status, body) = dispatch(server.addr, &WorkerId::from("W2"), "whatever")
        .await
        .unwrap();

    assert_eq!(status, 503);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("not currently connected"));
    assert_eq!(body["workerId"], "W2");
}

#[tokio::test]
async fn test_reconnect_without_register_is_not_dispatched_to() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let mut ws = register_worker(server.addr, &worker_id, "s").await;
    ws.close(None).await.expect("close failed");
    drop(ws);
    wait_until(|| !server.state.hub.connections.contains(&worker_id)).await;

    // Same credentials, but the new socket never sends `register`.
    let mut ws = connect_worker(server.addr, Some(BROKER_SECRET), &worker_id, "s")
        .await
        .expect("Failed to connect worker");
    wait_until(|| server.state.hub.connections.contains(&worker_id)).await;

    let (status, body) = dispatch(server.addr, &worker_id, "s").await.unwrap();
    assert_eq!(status, 503);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("has not registered"));
    assert!(timeout(Duration::from_millis(300), ws.next()).await.is_err());
    assert!(server.state.hub.pending.is_empty());
}

#[tokio::test]
async fn test_dispatch_missing_fields_and_wrong_secret() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let _ws = register_worker(server.addr, &worker_id, "right").await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/local-proxy/dispatch", server.addr))
        .json(&json!({"action": "generate_task", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let (status, body) = dispatch(server.addr, &worker_id, "wrong").await.unwrap();
    assert_eq!(status, 401);
    assert!(!body.to_string().contains("right"));
}

#[tokio::test]
async fn test_worker_drop_yields_timeout_and_late_reply_is_dropped() {
    let server = start_test_server(Duration::from_millis(500)).await;
    let worker_id = WorkerId::new();
    let mut ws = register_worker(server.addr, &worker_id, "w1-secret").await;

    let call = dispatch(server.addr, &worker_id, "w1-secret");
    let request = recv_envelope(&mut ws).await;
    let correlation_id = request.correlation_id.unwrap();

    ws.close(None).await.expect("close failed");
    drop(ws);

    let (status, body) = call.await.unwrap();
    assert_eq!(status, 504);
    assert_eq!(body["timeoutMs"], 500);
    assert_eq!(body["workerId"], worker_id.as_str());
    assert!(server.state.hub.pending.is_empty());

    // Credentials survive the drop, so the worker can come back and answer late.
    assert!(server.state.hub.credentials.contains(&worker_id));
    let mut ws = register_worker(server.addr, &worker_id, "w1-secret").await;
    send_envelope(&mut ws, ai_response(&correlation_id, "w1-secret", "too late")).await;

    // The late reply is dropped silently; the channel keeps working.
    send_envelope(&mut ws, Envelope::heartbeat()).await;
    assert_eq!(recv_envelope(&mut ws).await.kind, EnvelopeType::HeartbeatAck);
    assert!(server.state.hub.pending.is_empty());
}

#[tokio::test]
async fn test_forged_secret_never_resolves() {
    let server = start_test_server(Duration::from_millis(600)).await;
    let worker_id = WorkerId::new();
    let mut ws = register_worker(server.addr, &worker_id, "genuine").await;

    let call = dispatch(server.addr, &worker_id, "genuine");
    let request = recv_envelope(&mut ws).await;
    let correlation_id = request.correlation_id.unwrap();

    send_envelope(&mut ws, ai_response(&correlation_id, "forged", "injected")).await;
    let rejection = recv_envelope(&mut ws).await;
    assert_eq!(rejection.kind, EnvelopeType::Error);

    let (status, _body) = call.await.unwrap();
    assert_eq!(status, 504);
}

#[tokio::test]
async fn test_worker_error_is_returned_to_caller() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let mut ws = register_worker(server.addr, &worker_id, "w-secret").await;

    let call = dispatch(server.addr, &worker_id, "w-secret");
    let request = recv_envelope(&mut ws).await;
    send_envelope(
        &mut ws,
        Envelope::new(EnvelopeType::Error, json!({"error": "model not loaded"}))
            .correlated(request.correlation_id.unwrap())
            .signed("w-secret"),
    )
    .await;

    let (status, body) = call.await.unwrap();
    assert_eq!(status, 502);
    assert!(body["error"].as_str().unwrap().contains("model not loaded"));
}

#[tokio::test]
async fn test_register_mismatch_closes_channel() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let mut ws = connect_worker(server.addr, Some(BROKER_SECRET), &worker_id, "metadata-secret")
        .await
        .expect("Failed to connect worker");

    send_envelope(
        &mut ws,
        Envelope::new(
            EnvelopeType::Register,
            json!({"workerId": worker_id, "secret": "different-secret"}),
        ),
    )
    .await;

    let reply = recv_envelope(&mut ws).await;
    assert_eq!(reply.kind, EnvelopeType::RegisterError);
    assert!(try_recv_envelope(&mut ws).await.is_none());

    let state = Arc::clone(&server.state);
    wait_until(|| !state.hub.connections.contains(&worker_id)).await;
    assert!(server.state.hub.credentials.is_empty());
}

#[tokio::test]
async fn test_channel_requires_broker_secret() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();

    for secret in [None, Some("wrong-broker-secret")] {
        let Err(err) = connect_worker(server.addr, secret, &worker_id, "s").await else {
            panic!("handshake should be rejected");
        };
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status().as_u16(), 401);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
    assert!(server.state.hub.connections.is_empty());
}

#[tokio::test]
async fn test_known_worker_cannot_reconnect_with_other_secret() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let _ws = register_worker(server.addr, &worker_id, "original").await;

    let Err(err) = connect_worker(server.addr, Some(BROKER_SECRET), &worker_id, "hijack").await
    else {
        panic!("handshake should be rejected");
    };
    assert!(matches!(
        err,
        tokio_tungstenite::tungstenite::Error::Http(ref r) if r.status().as_u16() == 401
    ));
}

#[tokio::test]
async fn test_heartbeat_advances_last_heartbeat() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let mut ws = register_worker(server.addr, &worker_id, "s").await;
    let registered = server.state.hub.credentials.get(&worker_id).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    send_envelope(&mut ws, Envelope::heartbeat()).await;
    assert_eq!(recv_envelope(&mut ws).await.kind, EnvelopeType::HeartbeatAck);

    let refreshed = server.state.hub.credentials.get(&worker_id).unwrap();
    assert!(refreshed.last_heartbeat > registered.last_heartbeat);
}

#[tokio::test]
async fn test_newer_connection_replaces_older() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let mut first = register_worker(server.addr, &worker_id, "s").await;
    let mut second = register_worker(server.addr, &worker_id, "s").await;

    assert!(try_recv_envelope(&mut first).await.is_none());
    drop(first);

    let call = dispatch(server.addr, &worker_id, "s");
    let request = recv_envelope(&mut second).await;
    send_envelope(
        &mut second,
        ai_response(&request.correlation_id.unwrap(), "s", "from the new socket"),
    )
    .await;
    let (status, body) = call.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["text"], "from the new socket");
}

#[tokio::test]
async fn test_status_endpoint() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let client = reqwest::Client::new();
    let url = format!("http://{}/api/local-proxy/status", server.addr);

    let body: Value = client
        .post(&url)
        .json(&json!({"workerId": worker_id, "callerSecret": "s"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connected"], false);
    assert_eq!(body["registered"], false);
    assert_eq!(body["credentialsValid"], false);

    let _ws = register_worker(server.addr, &worker_id, "s").await;
    let body: Value = client
        .post(&url)
        .json(&json!({"workerId": worker_id, "callerSecret": "s"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connected"], true);
    assert_eq!(body["registered"], true);
    assert_eq!(body["credentialsValid"], true);
    assert_eq!(body["displayName"], "Test Worker");
    assert!(body.get("secret").is_none());
}

#[tokio::test]
async fn test_admin_listing_requires_broker_secret() {
    let server = start_test_server(Duration::from_secs(10)).await;
    let worker_id = WorkerId::new();
    let _ws = register_worker(server.addr, &worker_id, "hidden").await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/admin/workers", server.addr);

    let denied = client.get(&url).send().await.unwrap();
    assert_eq!(denied.status().as_u16(), 401);

    let response = client.get(&url).bearer_auth(BROKER_SECRET).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    assert!(!text.contains("hidden"));
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body[0]["workerId"], worker_id.as_str());
    assert_eq!(body[0]["connected"], true);
}
