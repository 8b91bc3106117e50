use thiserror::Error;

/// Why the security gate refused an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    EmergencyStop,
    RateLimited,
    DomainBlocked,
    NotAllowlisted,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::EmergencyStop => "emergency_stop",
            BlockReason::RateLimited => "rate_limited",
            BlockReason::DomainBlocked => "domain_blocked",
            BlockReason::NotAllowlisted => "not_allowlisted",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A malformed frame on the native-messaging leg. Connection-fatal:
    /// the byte stream is ambiguous past this point.
    #[error("Invalid frame: {0}")]
    Framing(String),

    #[error("Channel is not open")]
    ChannelNotOpen,

    #[error("Extension is not connected")]
    NotConnected,

    #[error("Request '{op}' timed out after {timeout_ms}ms")]
    Timeout { op: String, timeout_ms: u64 },

    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    #[error("Blocked by security policy: {0}")]
    Blocked(BlockReason),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The extension executed the action and reported a failure. The
    /// message is passed through verbatim.
    #[error("Action failed: {0}")]
    Executor(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
