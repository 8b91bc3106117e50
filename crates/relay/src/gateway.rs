//! The relay orchestrator on the gateway side.
//!
//! Owns at most one live extension-facing connection (last writer wins,
//! never two live at once) and exposes `invoke(operation, payload)` to the
//! tool layer: security gate first, then the request correlator, with the
//! outcome audited exactly once per invocation. The listener authenticates
//! connections during the WebSocket handshake; a rejected socket is closed
//! before any message is processed.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::{Response as HttpResponse, StatusCode};
use tracing::{debug, info, warn};

use tabpilot_core::{Envelope, Result};

use crate::channel::{ChannelEvent, SocketChannel};
use crate::correlator::RequestCorrelator;
use crate::security::SecurityGate;

pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

const AUDIT_TAIL_LIMIT: usize = 50;

pub struct RelayGateway {
    correlator: RequestCorrelator,
    gate: Arc<SecurityGate>,
}

impl RelayGateway {
    pub fn new(gate: Arc<SecurityGate>) -> Self {
        Self {
            correlator: RequestCorrelator::new(),
            gate,
        }
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    pub async fn is_extension_connected(&self) -> bool {
        self.correlator.is_connected().await
    }

    /// Run one operation through the gate and the correlator. The error
    /// cases stay distinct so the tool layer can tell "extension not
    /// connected" from "request timed out" from "action failed: ...".
    pub async fn invoke(&self, op: &str, payload: Option<Value>) -> Result<Value> {
        self.invoke_with_timeout(op, payload, DEFAULT_INVOKE_TIMEOUT).await
    }

    pub async fn invoke_with_timeout(
        &self,
        op: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let started = Instant::now();

        let outcome = match self.gate.authorize(op, payload.as_ref()) {
            Err(e) => Err(e),
            Ok(()) => match op {
                // Introspection is answered locally; it must work with the
                // extension gone or the emergency stop engaged.
                "security_status" => Ok(self.security_status().await),
                "audit_tail" => Ok(self.audit_tail()),
                _ => self.correlator.send(op, payload.clone(), timeout).await,
            },
        };

        self.gate
            .record_invocation(op, payload.as_ref(), &outcome, started.elapsed());
        outcome
    }

    async fn security_status(&self) -> Value {
        let config = self.gate.snapshot();
        json!({
            "connected": self.correlator.is_connected().await,
            "pendingRequests": self.correlator.pending_count().await,
            "emergencyStop": config.emergency_stop,
            "rateLimit": config.rate_limit,
            "domains": config.domains,
            "sensitiveActions": config.sensitive_actions,
        })
    }

    fn audit_tail(&self) -> Value {
        let entries = self.gate.audit_log().tail_today(AUDIT_TAIL_LIMIT);
        json!({ "entries": entries })
    }

    /// Close the active extension connection, rejecting whatever is still
    /// pending. Used on shutdown.
    pub async fn shutdown(&self) {
        if let Some(channel) = self.correlator.take().await {
            channel.close().await;
            info!("Extension connection closed");
        }
    }

    /// Bind the listening socket. Connections are served by
    /// [`GatewayServer::run`].
    pub async fn bind(self: Arc<Self>, host: &str, port: u16) -> Result<GatewayServer> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(GatewayServer {
            gateway: self,
            listener,
        })
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let gate = self.gate.clone();
        let rejection: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let rejection_in_callback = rejection.clone();

        let callback = move |req: &Request, response: Response| {
            let token = token_from_query(req.uri().query());
            let origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok());
            match gate.check_transport_auth(token.as_deref(), origin) {
                Ok(()) => Ok(response),
                Err(e) => {
                    let reason = e.to_string();
                    *rejection_in_callback
                        .lock()
                        .expect("rejection slot poisoned") = Some(reason.clone());
                    Err(HttpResponse::builder()
                        .status(StatusCode::UNAUTHORIZED)
                        .body(Some(reason))
                        .expect("static response builds"))
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                let reason = rejection.lock().expect("rejection slot poisoned").take();
                match reason {
                    Some(reason) => {
                        warn!(peer = %peer, reason = %reason, "Rejected gateway connection");
                        self.gate.record_auth_rejection(&reason);
                    }
                    None => debug!(peer = %peer, error = %e, "WebSocket handshake failed"),
                }
                return;
            }
        };

        let (channel, mut events) = SocketChannel::from_stream(ws);
        let channel_id = channel.id();
        if let Some(previous) = self.correlator.attach(channel).await {
            info!("Replacing previous extension connection");
            previous.close().await;
        }
        info!(peer = %peer, "Extension connected");

        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Message(value) => match serde_json::from_value::<Envelope>(value) {
                    Ok(Envelope::Response(response)) => {
                        self.correlator.handle_response(response).await;
                    }
                    Ok(Envelope::Request(request)) => {
                        debug!(op = %request.op, "Ignoring extension-initiated request");
                    }
                    Err(e) => {
                        warn!(error = %e, "Unrecognized frame from extension");
                    }
                },
                ChannelEvent::Closed { error } => {
                    if self.correlator.detach(channel_id).await {
                        match error {
                            Some(error) => warn!(peer = %peer, error = %error, "Extension connection lost"),
                            None => info!(peer = %peer, "Extension disconnected"),
                        }
                    }
                    break;
                }
            }
        }
    }
}

pub struct GatewayServer {
    gateway: Arc<RelayGateway>,
    listener: TcpListener,
}

impl GatewayServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the task is dropped or the listener errors.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tokio::spawn(self.gateway.clone().handle_connection(stream, peer));
        }
    }
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tabpilot_core::{ActionRequest, ActionResponse, Error, SecurityConfig};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use uuid::Uuid;

    struct TestHarness {
        gateway: Arc<RelayGateway>,
        addr: SocketAddr,
        base: std::path::PathBuf,
    }

    async fn start_gateway(mutate: impl FnOnce(&mut SecurityConfig)) -> TestHarness {
        let base = std::env::temp_dir().join(format!("tabpilot-gateway-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&base).unwrap();
        let mut config = SecurityConfig::default();
        mutate(&mut config);
        let gate = Arc::new(SecurityGate::new(
            config,
            base.join("security.json"),
            base.join("audit"),
        ));
        let gateway = Arc::new(RelayGateway::new(gate));
        let server = gateway.clone().bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        TestHarness { gateway, addr, base }
    }

    impl TestHarness {
        async fn connect_extension(
            &self,
            token: &str,
        ) -> tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        > {
            let url = if token.is_empty() {
                format!("ws://{}/", self.addr)
            } else {
                format!("ws://{}/?token={}", self.addr, token)
            };
            let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            ws
        }

        async fn wait_connected(&self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !self.gateway.is_extension_connected().await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("extension should register as connected");
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }

    /// Serve `count` requests on a raw extension socket, echoing per `reply`.
    async fn answer_requests<F>(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        count: usize,
        reply: F,
    ) where
        F: Fn(&ActionRequest) -> ActionResponse,
    {
        let mut handled = 0;
        while handled < count {
            match ws.next().await.expect("socket open") {
                Ok(WsMessage::Text(text)) => {
                    let request: ActionRequest = serde_json::from_str(&text).unwrap();
                    let response = serde_json::to_string(&reply(&request)).unwrap();
                    ws.send(WsMessage::Text(response)).await.unwrap();
                    handled += 1;
                }
                Ok(_) => {}
                Err(e) => panic!("extension socket error: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip_end_to_end() {
        let harness = start_gateway(|_| {}).await;
        let mut ws = harness.connect_extension("").await;
        harness.wait_connected().await;

        let extension = tokio::spawn(async move {
            answer_requests(&mut ws, 1, |req| {
                assert_eq!(req.op, "ping");
                ActionResponse::ok(&req.id, json!({"pong": true}))
            })
            .await;
        });

        let data = harness.gateway.invoke("ping", None).await.unwrap();
        assert_eq!(data, json!({"pong": true}));
        extension.await.unwrap();
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_invoke_without_extension_fails_not_connected_immediately() {
        let harness = start_gateway(|_| {}).await;
        let started = Instant::now();
        let err = harness.gateway.invoke("click", None).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_token_before_any_message() {
        let harness = start_gateway(|c| c.auth_token = "tok_good".to_string()).await;

        let url = format!("ws://{}/?token=tok_evil", harness.addr);
        let result = tokio_tungstenite::connect_async(url).await;
        assert!(result.is_err(), "handshake must fail");
        assert!(!harness.gateway.is_extension_connected().await);

        // The right token passes.
        let _ws = harness.connect_extension("tok_good").await;
        harness.wait_connected().await;
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_connection_drop_rejects_pending_before_timeout() {
        let harness = start_gateway(|_| {}).await;
        let mut ws = harness.connect_extension("").await;
        harness.wait_connected().await;

        let gateway = harness.gateway.clone();
        let invoke = tokio::spawn(async move {
            gateway
                .invoke_with_timeout("screenshot", None, Duration::from_secs(30))
                .await
        });

        // Swallow the request, then drop the socket without answering.
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(_) => {}
            other => panic!("expected request frame, got {other:?}"),
        }
        ws.close(None).await.unwrap();
        drop(ws);

        let started = Instant::now();
        let err = invoke.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionLost), "got {err:?}");
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "rejection must beat the 30s timeout"
        );
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_silent_extension_yields_timeout() {
        let harness = start_gateway(|_| {}).await;
        let _ws = harness.connect_extension("").await;
        harness.wait_connected().await;

        let err = harness
            .gateway
            .invoke_with_timeout("evaluate", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let harness = start_gateway(|_| {}).await;
        let mut first = harness.connect_extension("").await;
        harness.wait_connected().await;

        let mut second = harness.connect_extension("").await;
        // The first socket gets closed by the gateway.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match first.next().await {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }
        })
        .await
        .expect("first connection should be closed");

        // Requests now flow to the second connection.
        let extension = tokio::spawn(async move {
            answer_requests(&mut second, 1, |req| {
                ActionResponse::ok(&req.id, json!({"winner": "second"}))
            })
            .await;
        });
        let data = harness.gateway.invoke("ping", None).await.unwrap();
        assert_eq!(data["winner"], "second");
        extension.await.unwrap();
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_blocked_domain_never_reaches_extension() {
        let harness = start_gateway(|_| {}).await;
        let mut ws = harness.connect_extension("").await;
        harness.wait_connected().await;

        let err = harness
            .gateway
            .invoke("navigate", Some(json!({"url": "chrome://settings"})))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Blocked(tabpilot_core::BlockReason::DomainBlocked)),
            "got {err:?}"
        );

        // The extension saw nothing; the next frame it receives is the ping.
        let extension = tokio::spawn(async move {
            answer_requests(&mut ws, 1, |req| {
                assert_eq!(req.op, "ping", "blocked request must not be relayed");
                ActionResponse::ok(&req.id, json!({"pong": true}))
            })
            .await;
        });
        harness.gateway.invoke("ping", None).await.unwrap();
        extension.await.unwrap();
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_invoke_but_not_status() {
        let harness = start_gateway(|c| c.emergency_stop = true).await;
        let _ws = harness.connect_extension("").await;
        harness.wait_connected().await;

        let err = harness.gateway.invoke("ping", None).await.unwrap_err();
        assert!(
            matches!(err, Error::Blocked(tabpilot_core::BlockReason::EmergencyStop)),
            "got {err:?}"
        );

        let status = harness.gateway.invoke("security_status", None).await.unwrap();
        assert_eq!(status["emergencyStop"], true);
        assert_eq!(status["connected"], true);
        harness.cleanup();
    }

    #[tokio::test]
    async fn test_invocations_are_audited_with_outcomes() {
        let harness = start_gateway(|_| {}).await;
        let mut ws = harness.connect_extension("").await;
        harness.wait_connected().await;

        let extension = tokio::spawn(async move {
            answer_requests(&mut ws, 2, |req| match req.op.as_str() {
                "ping" => ActionResponse::ok(&req.id, json!({"pong": true})),
                _ => ActionResponse::err(&req.id, "no such tab"),
            })
            .await;
        });

        harness.gateway.invoke("ping", None).await.unwrap();
        let _ = harness.gateway.invoke("close_tab", None).await.unwrap_err();
        let _ = harness
            .gateway
            .invoke("navigate", Some(json!({"url": "chrome://flags"})))
            .await
            .unwrap_err();
        extension.await.unwrap();

        let tail = harness.gateway.invoke("audit_tail", None).await.unwrap();
        let entries = tail["entries"].as_array().unwrap();
        let results: Vec<&str> = entries
            .iter()
            .map(|e| e["result"].as_str().unwrap())
            .collect();
        assert!(results.contains(&"success"));
        assert!(results.contains(&"error"));
        assert!(results.contains(&"blocked"));
        harness.cleanup();
    }

    #[test]
    fn test_token_from_query_parses_and_decodes() {
        assert_eq!(token_from_query(Some("token=abc123")), Some("abc123".to_string()));
        assert_eq!(
            token_from_query(Some("a=1&token=tok%20x&b=2")),
            Some("tok x".to_string())
        );
        assert_eq!(token_from_query(Some("a=1")), None);
        assert_eq!(token_from_query(None), None);
    }
}
