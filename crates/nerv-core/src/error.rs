//! Shared error type across NERV crates.

use thiserror::Error;

/// Stable diagnostic codes carried by telemetry `dropped`/`rejected` signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// Malformed or incomplete envelope.
    StructureInvalid,
    /// Channel is not READY.
    ChannelNotReady,
    /// Channel is draining and refuses new sends.
    ChannelDraining,
    /// Bounded buffer at capacity.
    BufferFull,
    /// Peer answered the handshake with something other than the expected ACK.
    HandshakeRejected,
    /// No handshake reply within the configured wait.
    HandshakeTimeout,
    /// Protocol version disagreement.
    ProtocolMismatch,
    /// Physical transport failure.
    Transport,
    /// Internal error.
    Internal,
}

impl ReasonCode {
    /// String representation used in telemetry metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::StructureInvalid => "STRUCTURE_INVALID",
            ReasonCode::ChannelNotReady => "CHANNEL_NOT_READY",
            ReasonCode::ChannelDraining => "CHANNEL_DRAINING",
            ReasonCode::BufferFull => "BUFFER_FULL",
            ReasonCode::HandshakeRejected => "HANDSHAKE_REJECTED",
            ReasonCode::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            ReasonCode::ProtocolMismatch => "PROTOCOL_MISMATCH",
            ReasonCode::Transport => "TRANSPORT",
            ReasonCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, NervError>;

/// Unified error type used by core and relay.
#[derive(Debug, Error)]
pub enum NervError {
    #[error("invalid envelope structure: {0}")]
    Structure(String),
    #[error("invalid construction: {0}")]
    Construction(String),
    #[error("buffer at capacity")]
    Capacity,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("internal: {0}")]
    Internal(String),
}

impl NervError {
    /// Map an error to its stable diagnostic code.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            NervError::Structure(_) | NervError::Construction(_) => ReasonCode::StructureInvalid,
            NervError::Capacity => ReasonCode::BufferFull,
            NervError::Protocol(_) | NervError::UnsupportedVersion => ReasonCode::ProtocolMismatch,
            NervError::Transport(_) | NervError::FrameTooLarge { .. } => ReasonCode::Transport,
            NervError::Config(_) | NervError::Internal(_) => ReasonCode::Internal,
        }
    }
}
