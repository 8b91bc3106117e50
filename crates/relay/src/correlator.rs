//! Request/response correlation for the gateway's extension-facing leg.
//!
//! One pending entry per in-flight request, keyed by envelope id. An entry
//! resolves exactly once: the first of {matching response, timeout, channel
//! close} wins and the losers are no-ops. When no channel is attached,
//! `send` fails fast with `NotConnected`; the tool layer has a caller to
//! report to, so nothing is queued on this side.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

use tabpilot_core::{ActionRequest, ActionResponse, Error, Result};

use crate::channel::SocketChannel;

pub struct RequestCorrelator {
    channel: Mutex<Option<SocketChannel>>,
    pending: Mutex<HashMap<String, oneshot::Sender<ActionResponse>>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            channel: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Install a new active channel, returning the previous one so the
    /// caller can close it. Pending entries belong to the old channel and
    /// are bulk-rejected.
    pub async fn attach(&self, channel: SocketChannel) -> Option<SocketChannel> {
        let previous = {
            let mut guard = self.channel.lock().await;
            guard.replace(channel)
        };
        if previous.is_some() {
            self.fail_all_pending().await;
        }
        previous
    }

    /// Drop the active channel if it is still the one identified by
    /// `channel_id`; a stale close handler must not clobber a replacement.
    /// Returns true when the channel was detached.
    pub async fn detach(&self, channel_id: u64) -> bool {
        let detached = {
            let mut guard = self.channel.lock().await;
            match guard.as_ref() {
                Some(current) if current.id() == channel_id => {
                    *guard = None;
                    true
                }
                _ => false,
            }
        };
        if detached {
            self.fail_all_pending().await;
        }
        detached
    }

    /// Remove and return the active channel (shutdown path). Pending
    /// entries are bulk-rejected.
    pub async fn take(&self) -> Option<SocketChannel> {
        let channel = self.channel.lock().await.take();
        if channel.is_some() {
            self.fail_all_pending().await;
        }
        channel
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Reject every in-flight request with `ConnectionLost`. Dropping the
    /// senders wakes each waiter exactly once.
    pub async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!(count = pending.len(), "Rejecting pending requests after connection loss");
        }
        pending.clear();
    }

    /// Route a response to its pending entry. A response whose id matches
    /// nothing (late arrival after timeout, or a stale connection) is
    /// discarded without effect.
    pub async fn handle_response(&self, response: ActionResponse) {
        let waiter = self.pending.lock().await.remove(&response.id);
        match waiter {
            Some(tx) => {
                // The receiver may have given up between map removal and
                // here; that race is fine, the entry is gone either way.
                let _ = tx.send(response);
            }
            None => {
                debug!(id = %response.id, "Discarding response with no pending request");
            }
        }
    }

    /// Send one operation to the extension and await its response.
    pub async fn send(
        &self,
        op: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)?;

        let (id, rx) = {
            let mut pending = self.pending.lock().await;
            let mut id = Uuid::new_v4().to_string();
            while pending.contains_key(&id) {
                id = Uuid::new_v4().to_string();
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id.clone(), tx);
            (id, rx)
        };

        let request = ActionRequest::new(id.clone(), op, payload);
        let envelope = serde_json::to_value(&request)?;
        if let Err(e) = channel.send(&envelope).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response.data.unwrap_or(Value::Null))
                } else {
                    Err(Error::Executor(
                        response
                            .error
                            .unwrap_or_else(|| "unspecified failure".to_string()),
                    ))
                }
            }
            // Sender dropped: the channel closed underneath the request.
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                // Removing the entry makes any later response a no-op.
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout {
                    op: op.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn sent_request(msg: Option<WsMessage>) -> ActionRequest {
        match msg {
            Some(WsMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_without_channel_fails_not_connected_immediately() {
        let correlator = RequestCorrelator::new();
        let started = Instant::now();
        let err = correlator
            .send("click", None, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected), "got {err:?}");
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "must not wait for the timeout"
        );
    }

    #[tokio::test]
    async fn test_response_resolves_matching_request() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (channel, mut outbound) = SocketChannel::test_pair();
        correlator.attach(channel).await;

        let c = correlator.clone();
        let invoke = tokio::spawn(async move {
            c.send("ping", None, Duration::from_secs(5)).await
        });

        let request = sent_request(outbound.recv().await);
        assert_eq!(request.op, "ping");
        correlator
            .handle_response(ActionResponse::ok(&request.id, json!({"pong": true})))
            .await;

        let data = invoke.await.unwrap().unwrap();
        assert_eq!(data, json!({"pong": true}));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_executor_failure_passes_message_through() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (channel, mut outbound) = SocketChannel::test_pair();
        correlator.attach(channel).await;

        let c = correlator.clone();
        let invoke =
            tokio::spawn(async move { c.send("click", None, Duration::from_secs(5)).await });

        let request = sent_request(outbound.recv().await);
        correlator
            .handle_response(ActionResponse::err(&request.id, "element not found"))
            .await;

        match invoke.await.unwrap().unwrap_err() {
            Error::Executor(msg) => assert_eq!(msg, "element not found"),
            other => panic!("expected executor error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_late_response_is_noop() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (channel, mut outbound) = SocketChannel::test_pair();
        correlator.attach(channel).await;

        let err = correlator
            .send("screenshot", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        assert_eq!(correlator.pending_count().await, 0);

        // The response shows up after the timeout already won.
        let request = sent_request(outbound.recv().await);
        correlator
            .handle_response(ActionResponse::ok(&request.id, json!({"late": true})))
            .await;
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_id_response_is_discarded() {
        let correlator = RequestCorrelator::new();
        let (channel, _outbound) = SocketChannel::test_pair();
        correlator.attach(channel).await;
        // No pending entry exists; this must be a silent no-op.
        correlator
            .handle_response(ActionResponse::ok("no-such-id", Value::Null))
            .await;
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_detach_rejects_all_pending_with_connection_lost() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (channel, mut outbound) = SocketChannel::test_pair();
        let channel_id = channel.id();
        correlator.attach(channel).await;

        let c = correlator.clone();
        let invoke = tokio::spawn(async move {
            c.send("navigate", Some(json!({"url": "https://example.com"})), Duration::from_secs(30))
                .await
        });
        let _ = sent_request(outbound.recv().await);
        assert_eq!(correlator.pending_count().await, 1);

        let started = Instant::now();
        assert!(correlator.detach(channel_id).await);
        let err = invoke.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionLost), "got {err:?}");
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "rejection must not wait out the request timeout"
        );
    }

    #[tokio::test]
    async fn test_stale_detach_does_not_touch_replacement_channel() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (old_channel, _old_outbound) = SocketChannel::test_pair();
        let old_id = old_channel.id();
        correlator.attach(old_channel).await;

        let (new_channel, mut new_outbound) = SocketChannel::test_pair();
        correlator.attach(new_channel).await;

        // The old channel's close handler fires after the replacement.
        assert!(!correlator.detach(old_id).await);
        assert!(correlator.is_connected().await);

        let c = correlator.clone();
        let invoke =
            tokio::spawn(async move { c.send("ping", None, Duration::from_secs(5)).await });
        let request = sent_request(new_outbound.recv().await);
        correlator
            .handle_response(ActionResponse::ok(&request.id, json!({"pong": true})))
            .await;
        assert!(invoke.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_invokes_each_resolve_exactly_once() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (channel, mut outbound) = SocketChannel::test_pair();
        correlator.attach(channel).await;

        let mut invokes = Vec::new();
        for i in 0..10 {
            let c = correlator.clone();
            invokes.push(tokio::spawn(async move {
                c.send("evaluate", Some(json!({"n": i})), Duration::from_secs(5))
                    .await
            }));
        }

        // Answer out of order: reverse arrival order of the requests.
        let mut requests = Vec::new();
        for _ in 0..10 {
            requests.push(sent_request(outbound.recv().await));
        }
        for request in requests.iter().rev() {
            let n = request.payload.as_ref().unwrap()["n"].clone();
            correlator
                .handle_response(ActionResponse::ok(&request.id, json!({"echo": n})))
                .await;
        }

        for (i, invoke) in invokes.into_iter().enumerate() {
            let data = invoke.await.unwrap().unwrap();
            assert_eq!(data["echo"], i as u64, "answer matched by id, not order");
        }
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_ids_are_unique_across_inflight_requests() {
        let correlator = Arc::new(RequestCorrelator::new());
        let (channel, mut outbound) = SocketChannel::test_pair();
        correlator.attach(channel).await;

        for _ in 0..25 {
            let c = correlator.clone();
            tokio::spawn(async move { c.send("ping", None, Duration::from_secs(5)).await });
        }
        let mut seen = std::collections::HashSet::new();
        for _ in 0..25 {
            let request = sent_request(outbound.recv().await);
            assert!(seen.insert(request.id.clone()), "duplicate id {}", request.id);
        }
    }
}
