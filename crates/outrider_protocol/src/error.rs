//! Error types shared across the agent crates.

use thiserror::Error;

/// Wire codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame magic mismatch: got {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("protocol revision mismatch: ours {ours}, theirs {theirs}")]
    RevisionMismatch { ours: u8, theirs: u8 },

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpCode(u8),

    #[error("frame truncated: need at least {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("frame too large: {size} bytes (cap {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("expected a single-frame message, got {0} frames")]
    MultipartFrame(usize),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Agent-level failures that cross component boundaries.
#[derive(Debug, Error)]
pub enum AgentError {
    /// All controller candidates were exhausted without a successful
    /// sign-in. The supervisor restarts on this.
    #[error("no controller could be reached or all controllers denied the connection attempt")]
    NoController,

    /// A channel send timed out. Recoverable; the return is dropped
    /// after a log line.
    #[error("request to controller {master} timed out after {timeout_secs}s")]
    TransportTimeout { master: String, timeout_secs: u64 },

    /// Unusable configuration. The process exits non-zero.
    #[error("fatal configuration error: {0}")]
    ConfigFatal(String),

    /// A recoverable channel failure (socket error, handshake refused,
    /// malformed reply).
    #[error("channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Exit code for fatal configuration errors, after the convention
    /// of the original platform.
    pub const EX_CONFIG: i32 = 78;
}
