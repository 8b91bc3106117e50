//! Reconnection state machine with exponential backoff.
//!
//! [`ReconnectState`] is the pure transition machine; [`ReconnectSupervisor`]
//! drives it against an async [`Connector`]. The machine is instantiated once
//! per leg (bridge→gateway, extension→bridge) and never shares state across
//! legs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use tabpilot_core::Result;

/// Connection lifecycle of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until an explicit reconnect command resets the machine.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Backoff schedule: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// The pure reconnect state machine. Transitions:
///
/// ```text
/// Disconnected -> Connecting -> Connected
///                      \-> Reconnecting (delay) -> Connecting ...
///                      \-> Failed (after max_attempts)
/// ```
#[derive(Debug)]
pub struct ReconnectState {
    policy: BackoffPolicy,
    state: ConnectionState,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Enter `Connecting`. Returns false from `Failed`: leaving the terminal
    /// state requires an explicit [`ReconnectState::reset`].
    pub fn begin_attempt(&mut self) -> bool {
        if self.state == ConnectionState::Failed {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// A connection attempt succeeded; the failure streak resets.
    pub fn connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// A connection attempt failed. `Some(delay)` schedules the next try;
    /// `None` means the machine just went `Failed` and nothing more will be
    /// scheduled.
    pub fn attempt_failed(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            None
        } else {
            self.state = ConnectionState::Reconnecting;
            Some(delay)
        }
    }

    /// An established connection dropped unexpectedly. Same schedule as a
    /// connect failure.
    pub fn connection_lost(&mut self) -> Option<Duration> {
        self.attempt_failed()
    }

    /// Explicit reconnect command: clears `Failed` and the failure streak.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
    }
}

/// The seam between the supervisor and the transport, so the machine is
/// testable without a socket.
#[async_trait]
pub trait Connector: Send {
    type Connection: Send;

    async fn connect(&mut self) -> Result<Self::Connection>;
}

/// Drives a [`ReconnectState`] against a [`Connector`].
///
/// At most one retry timer is pending at any moment: the delay lives inside
/// [`ReconnectSupervisor::acquire`], and a manual wake cancels the remainder
/// of the wait before the next attempt starts.
pub struct ReconnectSupervisor<C: Connector> {
    connector: C,
    state: ReconnectState,
    pending_delay: Option<Duration>,
    wake: Arc<Notify>,
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(connector: C, policy: BackoffPolicy) -> Self {
        Self {
            connector,
            state: ReconnectState::new(policy),
            pending_delay: None,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn is_failed(&self) -> bool {
        self.state.state() == ConnectionState::Failed
    }

    /// Handle for skipping the current backoff delay (a manual "connect now").
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Record that the live connection dropped; the next
    /// [`ReconnectSupervisor::acquire`] waits out the scheduled delay first.
    pub fn connection_lost(&mut self) {
        self.pending_delay = self.state.connection_lost();
        if let Some(delay) = self.pending_delay {
            warn!(delay_ms = delay.as_millis() as u64, "Connection lost, retry scheduled");
        } else {
            error!("Connection lost and retry budget exhausted");
        }
    }

    /// Explicit reconnect command: leaves `Failed` and retries immediately.
    pub fn reset(&mut self) {
        self.state.reset();
        self.pending_delay = None;
    }

    /// Attempt until connected or the machine goes `Failed`. Returns `None`
    /// once `Failed`; the caller decides whether to `reset` and try again.
    pub async fn acquire(&mut self) -> Option<C::Connection> {
        loop {
            if let Some(delay) = self.pending_delay.take() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.wake.notified() => {
                        info!("Backoff interrupted by explicit connect");
                    }
                }
            }
            if !self.state.begin_attempt() {
                return None;
            }
            match self.connector.connect().await {
                Ok(conn) => {
                    self.state.connected();
                    return Some(conn);
                }
                Err(e) => match self.state.attempt_failed() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            attempt = self.state.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "Connect failed, retrying"
                        );
                        self.pending_delay = Some(delay);
                    }
                    None => {
                        error!(
                            error = %e,
                            attempts = self.state.attempts(),
                            "Connect failed, giving up"
                        );
                        return None;
                    }
                },
            }
        }
    }
}
