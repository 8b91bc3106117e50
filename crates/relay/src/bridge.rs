//! The bridge process: native-messaging stdio on one side, the gateway's
//! WebSocket port on the other.
//!
//! The extension-facing leg has no synchronous caller to fail back to, so
//! frames arriving while the gateway leg is down are buffered in an
//! unbounded FIFO and flushed in order on reconnect, the one place in the
//! relay that queues instead of failing fast. Stdout carries frames only;
//! every diagnostic goes to stderr via tracing.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use tabpilot_core::{Error, Result};

use crate::channel::{ChannelEvent, SocketChannel};
use crate::framing::{encode_frame, FrameDecoder};
use crate::reconnect::{BackoffPolicy, Connector, ReconnectSupervisor};

/// Sanity cap for one native-messaging frame. Screenshots ride these frames,
/// so the cap is generous; the codec itself is capless.
pub const MAX_NATIVE_FRAME_BYTES: usize = 64 * 1024 * 1024;

const STDIN_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub gateway_url: String,
    pub backoff: BackoffPolicy,
    pub max_frame_bytes: usize,
}

impl BridgeConfig {
    pub fn new(port: u16, auth_token: &str) -> Result<Self> {
        let mut url = Url::parse(&format!("ws://127.0.0.1:{port}/"))
            .map_err(|e| Error::Config(format!("invalid gateway port {port}: {e}")))?;
        if !auth_token.is_empty() {
            url.query_pairs_mut().append_pair("token", auth_token);
        }
        Ok(Self {
            gateway_url: url.to_string(),
            backoff: BackoffPolicy::default(),
            max_frame_bytes: MAX_NATIVE_FRAME_BYTES,
        })
    }
}

struct GatewayConnector {
    url: String,
}

#[async_trait]
impl Connector for GatewayConnector {
    type Connection = (SocketChannel, mpsc::Receiver<ChannelEvent>);

    async fn connect(&mut self) -> Result<Self::Connection> {
        SocketChannel::connect(&self.url).await
    }
}

pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Run against the process's real stdio. Spawned by the browser's
    /// native-messaging host machinery.
    pub async fn run(self) -> Result<()> {
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout()).await
    }

    pub async fn run_with_io<R, W>(self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // Extension -> gateway. Unbounded: frames pile up here while the
        // gateway leg is down and flush in arrival order on reconnect.
        let (to_gateway_tx, mut to_gateway_rx) = mpsc::unbounded_channel::<Value>();
        // Gateway -> extension, drained by the stdout writer.
        let (to_extension_tx, to_extension_rx) = mpsc::unbounded_channel::<Value>();

        // A framing error is connection-fatal for the stdio leg, which for
        // the bridge means the process; the reader parks it here before
        // hanging up the queue.
        let stdio_fault: Arc<StdMutex<Option<Error>>> = Arc::new(StdMutex::new(None));

        spawn_stdin_reader(
            input,
            to_gateway_tx,
            self.config.max_frame_bytes,
            stdio_fault.clone(),
        );
        spawn_stdout_writer(output, to_extension_rx);

        let mut supervisor = ReconnectSupervisor::new(
            GatewayConnector {
                url: self.config.gateway_url.clone(),
            },
            self.config.backoff.clone(),
        );

        // A frame that hit a dying channel mid-send; resent first after
        // reconnect so ordering holds.
        let mut carry: Option<Value> = None;

        loop {
            let Some((channel, mut events)) = supervisor.acquire().await else {
                return Err(Error::Other(
                    "gateway unreachable, reconnect budget exhausted".to_string(),
                ));
            };
            info!(url = %self.config.gateway_url, "Connected to gateway");

            if let Some(frame) = carry.take() {
                if channel.send(&frame).await.is_err() {
                    carry = Some(frame);
                    supervisor.connection_lost();
                    continue;
                }
            }

            loop {
                tokio::select! {
                    maybe_frame = to_gateway_rx.recv() => {
                        match maybe_frame {
                            Some(frame) => {
                                if channel.send(&frame).await.is_err() {
                                    // Hold the frame; the Closed event tears
                                    // this connection down next.
                                    carry = Some(frame);
                                }
                            }
                            None => {
                                // Stdin ended (or faulted) and the queue is
                                // fully drained.
                                channel.close().await;
                                let fault = stdio_fault
                                    .lock()
                                    .expect("stdio fault slot poisoned")
                                    .take();
                                return match fault {
                                    Some(e) => Err(e),
                                    None => {
                                        info!("Extension closed the native-messaging pipe, exiting");
                                        Ok(())
                                    }
                                };
                            }
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Some(ChannelEvent::Message(message)) => {
                                if to_extension_tx.send(message).is_err() {
                                    return Err(Error::Other(
                                        "stdout writer is gone".to_string(),
                                    ));
                                }
                            }
                            Some(ChannelEvent::Closed { error: Some(e) }) => {
                                warn!(error = %e, "Gateway connection lost");
                                supervisor.connection_lost();
                                break;
                            }
                            Some(ChannelEvent::Closed { error: None }) | None => {
                                info!("Gateway connection closed");
                                supervisor.connection_lost();
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn spawn_stdin_reader<R>(
    mut input: R,
    to_gateway: mpsc::UnboundedSender<Value>,
    max_frame_bytes: usize,
    fault: Arc<StdMutex<Option<Error>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::with_max_frame_bytes(max_frame_bytes);
        let mut buf = vec![0u8; STDIN_CHUNK_BYTES];
        loop {
            match input.read(&mut buf).await {
                Ok(0) => {
                    debug!("Native-messaging pipe reached EOF");
                    break;
                }
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => {
                                if to_gateway.send(frame).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!(error = %e, "Malformed native-messaging frame, shutting down");
                                *fault.lock().expect("stdio fault slot poisoned") = Some(e);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed reading native-messaging pipe");
                    *fault.lock().expect("stdio fault slot poisoned") = Some(e.into());
                    return;
                }
            }
        }
    });
}

fn spawn_stdout_writer<W>(mut output: W, mut to_extension: mpsc::UnboundedReceiver<Value>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = to_extension.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if output.write_all(&frame).await.is_err() || output.flush().await.is_err() {
                debug!("Native-messaging stdout closed");
                return;
            }
        }
    });
}
