use locus::{LocusError, Rank};

pub type Result<T> = std::result::Result<T, TcpError>;

#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    #[error("hub rejected rank {rank}: {reason}")]
    Rejected { rank: Rank, reason: String },

    #[error("hub at {addr} unreachable after {timeout_ms}ms")]
    HubUnreachable { addr: String, timeout_ms: u64 },

    #[error("hub connection closed")]
    HubClosed,

    #[error("rank {rank} disconnected before shutdown")]
    PeerLost { rank: Rank },

    #[error("job formation timed out: {joined}/{expected} ranks joined")]
    FormationTimeout { joined: i32, expected: i32 },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("hub task failed: {0}")]
    HubTask(String),
}

impl TcpError {
    /// Wrap as the substrate failure of `operation`.
    pub fn into_locus(self, operation: &'static str) -> LocusError {
        let message = self.to_string();
        LocusError::substrate_with_source(operation, message, self)
    }
}
