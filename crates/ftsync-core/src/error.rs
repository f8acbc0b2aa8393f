//! Error types for FTSync

use thiserror::Error;

/// Result type alias using the FTSync error
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes carried by `NACK=<code>` replies.
///
/// Codes are negative so a NACK can never be confused with a byte count.
pub mod status {
    /// Generic internal failure
    pub const INTERNAL: i32 = -4000;
    /// Password mismatch during the handshake
    pub const AUTHENTICATION_FAILURE: i32 = -4001;
    /// Socket level read/write failure
    pub const IO_FAILURE: i32 = -4002;
    /// Stream ended (length-0 frame or stop request)
    pub const END_OF_STREAM: i32 = -4003;
    /// Stream cancelled by the sender
    pub const CANCELLED: i32 = -4004;
    /// Malformed frame, banner, line or reply
    pub const PROTOCOL: i32 = -4005;
    /// Line exceeded the receive buffer
    pub const BUFFER_OVERFLOW: i32 = -4006;
    /// Operation not supported by a forward-only stream
    pub const NOT_SUPPORTED: i32 = -4007;
    /// Serialization engine failed to save or load
    pub const SERIALIZER: i32 = -4008;
    /// Guest memory read/write/protect failure
    pub const MEMORY: i32 = -4009;
    /// VM lifecycle transition failed
    pub const VM: i32 = -4010;
    /// Operation called from the wrong role or state
    pub const INVALID_STATE: i32 = -4011;
}

/// Fault tolerance error types
#[derive(Error, Debug)]
pub enum Error {
    /// Socket errors (connect, read, write, reset)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header with a bad magic or an out-of-range length
    #[error("Invalid frame: magic={magic:#x} length={length:#x}")]
    InvalidFrame {
        /// Magic value received
        magic: u32,
        /// Length value received
        length: u32,
    },

    /// Line longer than the receive buffer
    #[error("Line exceeds {limit} bytes")]
    BufferOverflow {
        /// Maximum accepted line length
        limit: usize,
    },

    /// Clean end of a framed stream
    #[error("End of stream")]
    EndOfStream,

    /// Framed stream cancelled by the peer
    #[error("Synchronization cancelled")]
    Cancelled,

    /// Handshake or framing violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Password rejected by the standby
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Peer answered a command with `NACK=<code>`
    #[error("Command rejected by peer (code {code})")]
    Nack {
        /// Status code reported by the peer
        code: i32,
    },

    /// Reply line that is neither ACK nor a well formed NACK
    #[error("Malformed reply: {0:?}")]
    MalformedReply(String),

    /// Operation not available on this stream
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Operation invoked from the wrong side of the link
    #[error("Operation not valid for the {0} role")]
    WrongRole(&'static str),

    /// No standby link is established
    #[error("Not connected to a standby")]
    NotConnected,

    /// VM is not in the state required by the operation
    #[error("Invalid VM state: {0}")]
    InvalidState(String),

    /// Serialization engine failure
    #[error("Serializer error: {0}")]
    Serializer(String),

    /// Guest memory manager failure
    #[error("Guest memory error: {0}")]
    Memory(String),

    /// VM lifecycle failure
    #[error("VM error: {0}")]
    Vm(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a serializer error
    pub fn serializer(msg: impl Into<String>) -> Self {
        Self::Serializer(msg.into())
    }

    /// Create a guest memory error
    pub fn memory(msg: impl Into<String>) -> Self {
        Self::Memory(msg.into())
    }

    /// Create a VM lifecycle error
    pub fn vm(msg: impl Into<String>) -> Self {
        Self::Vm(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Status code sent in a `NACK=<code>` line for this error
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Io(_) => status::IO_FAILURE,
            Self::InvalidFrame { .. } | Self::Protocol(_) | Self::MalformedReply(_) => {
                status::PROTOCOL
            }
            Self::BufferOverflow { .. } => status::BUFFER_OVERFLOW,
            Self::EndOfStream => status::END_OF_STREAM,
            Self::Cancelled => status::CANCELLED,
            Self::AuthenticationFailed => status::AUTHENTICATION_FAILURE,
            Self::Nack { code } => *code,
            Self::NotSupported(_) => status::NOT_SUPPORTED,
            Self::WrongRole(_) | Self::InvalidState(_) | Self::NotConnected => {
                status::INVALID_STATE
            }
            Self::Serializer(_) => status::SERIALIZER,
            Self::Memory(_) => status::MEMORY,
            Self::Vm(_) => status::VM,
            Self::Config(_) | Self::Internal(_) => status::INTERNAL,
        }
    }

    /// Whether the error leaves the connection unusable.
    ///
    /// Transport and framing errors end the session; a NACK or an
    /// application failure leaves the command channel line-aligned.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::InvalidFrame { .. }
                | Self::BufferOverflow { .. }
                | Self::Protocol(_)
                | Self::MalformedReply(_)
                | Self::NotConnected
        )
    }
}
