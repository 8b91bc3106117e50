//! Message-oriented duplex channel over a WebSocket.
//!
//! A [`SocketChannel`] wraps one WebSocket connection with a writer task fed
//! by an mpsc queue and a reader task that pumps [`ChannelEvent`]s to the
//! owner. The reader delivers exactly one `Closed` event per channel
//! lifetime, whether the peer closed cleanly, errored, or we closed locally.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use tabpilot_core::{Error, Result};

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Events delivered to the channel owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A JSON text message from the peer.
    Message(Value),
    /// Terminal event; delivered exactly once. `error` carries the transport
    /// error when the close was not clean.
    Closed { error: Option<String> },
}

/// Handle to one live WebSocket connection.
#[derive(Debug, Clone)]
pub struct SocketChannel {
    outbound: mpsc::Sender<WsMessage>,
    open: Arc<AtomicBool>,
    closing: Arc<Notify>,
    id: u64,
}

impl SocketChannel {
    /// Connect to a WebSocket URL (client side).
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ChannelEvent>)> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Other(format!("WebSocket connect to {url} failed: {e}")))?;
        Ok(Self::from_stream(ws))
    }

    /// Wrap an already-established WebSocket stream (either side).
    pub fn from_stream<S>(ws: WebSocketStream<S>) -> (Self, mpsc::Receiver<ChannelEvent>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_BUFFER);
        let open = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(Notify::new());
        let id = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);

        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, WsMessage::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = open.clone();
        let reader_closing = closing.clone();
        tokio::spawn(async move {
            let mut close_error: Option<String> = None;
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    // Local close: don't wait for the peer's close ack.
                    _ = reader_closing.notified() => break,
                };
                match item {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Value>(&text)
                    {
                        Ok(value) => {
                            if event_tx.send(ChannelEvent::Message(value)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Discarding non-JSON text frame");
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // The protocol is text-only; ping/pong are handled by
                        // tungstenite, binary frames carry nothing of ours.
                    }
                    Some(Err(e)) => {
                        close_error = Some(e.to_string());
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(ChannelEvent::Closed { error: close_error }).await;
        });

        (
            Self {
                outbound: out_tx,
                open,
                closing,
                id,
            },
            event_rx,
        )
    }

    /// Process-unique identity of this connection, used to make sure a stale
    /// channel's close handler cannot act on its replacement.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send one JSON message. Fails with `ChannelNotOpen` when the channel
    /// is closed or closing; a message is never silently dropped.
    pub async fn send(&self, message: &Value) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotOpen);
        }
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(WsMessage::Text(text))
            .await
            .map_err(|_| Error::ChannelNotOpen)
    }

    /// Close the channel. Idempotent; the owner still receives the single
    /// `Closed` event through the reader.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(WsMessage::Close(None)).await;
            self.closing.notify_one();
        }
    }

    /// Build a channel whose outbound end is observable in tests, with no
    /// socket behind it.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::Receiver<WsMessage>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            Self {
                outbound: out_tx,
                open: Arc::new(AtomicBool::new(true)),
                closing: Arc::new(Notify::new()),
                id: CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed),
            },
            out_rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn ws_server_and_client() -> (
        WebSocketStream<tokio::net::TcpStream>,
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        (accept.await.unwrap(), client)
    }

    async fn expect_single_closed(events: &mut mpsc::Receiver<ChannelEvent>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Closed { .. }) => break,
                    Some(ChannelEvent::Message(_)) => continue,
                    None => panic!("event stream ended without a Closed event"),
                }
            }
        })
        .await
        .expect("Closed event must arrive");
        // Nothing follows the terminal event; the stream just ends.
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        let (server, client) = ws_server_and_client().await;
        let (server_chan, mut server_events) = SocketChannel::from_stream(server);
        let (client_chan, mut client_events) = SocketChannel::from_stream(client);

        client_chan.send(&json!({"id": "1", "type": "ping"})).await.unwrap();
        match server_events.recv().await.unwrap() {
            ChannelEvent::Message(v) => assert_eq!(v["type"], "ping"),
            other => panic!("expected message, got {other:?}"),
        }

        server_chan
            .send(&json!({"id": "1", "success": true}))
            .await
            .unwrap();
        match client_events.recv().await.unwrap() {
            ChannelEvent::Message(v) => assert_eq!(v["success"], true),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_delivers_exactly_one_closed_event() {
        let (server, client) = ws_server_and_client().await;
        let (server_chan, _server_events) = SocketChannel::from_stream(server);
        let (client_chan, mut client_events) = SocketChannel::from_stream(client);

        server_chan.close().await;
        expect_single_closed(&mut client_events).await;
        assert!(!client_chan.is_open());
    }

    #[tokio::test]
    async fn test_send_after_close_fails_channel_not_open() {
        let (server, client) = ws_server_and_client().await;
        let (_server_chan, _server_events) = SocketChannel::from_stream(server);
        let (client_chan, mut client_events) = SocketChannel::from_stream(client);

        client_chan.close().await;
        let err = client_chan.send(&json!({"id": "x"})).await.unwrap_err();
        assert!(matches!(err, Error::ChannelNotOpen), "got {err:?}");

        // Local close still produces the single terminal event.
        expect_single_closed(&mut client_events).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, client) = ws_server_and_client().await;
        let (_sc, _se) = SocketChannel::from_stream(server);
        let (client_chan, mut client_events) = SocketChannel::from_stream(client);
        client_chan.close().await;
        client_chan.close().await;
        assert!(!client_chan.is_open());
        expect_single_closed(&mut client_events).await;
    }

    #[tokio::test]
    async fn test_channel_ids_are_unique() {
        let (a, _) = SocketChannel::test_pair();
        let (b, _) = SocketChannel::test_pair();
        assert_ne!(a.id(), b.id());
    }
}
