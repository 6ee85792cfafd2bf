use std::io;
use thiserror::Error;

/// Custom error types for the serial packet protocol
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Field access error: {0}")]
    Field(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Packet source closed")]
    Closed,
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new field access error
    pub fn field(msg: impl Into<String>) -> Self {
        Error::Field(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Whether this error ends the connection it was raised on
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Transport(_) | Error::Closed)
    }
}

/// Recoverable framing errors raised while decoding the byte stream.
///
/// The decoder has already resynchronized (or deliberately kept sync) by the
/// time one of these is returned, so callers only log and carry on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad packet: crc 0x{received:04x} does not match computed 0x{computed:04x}")]
    BadCrc { received: u16, computed: u16 },

    #[error("packet too long")]
    TooLong,

    #[error("unexpected sync byte after escape")]
    UnexpectedSync,
}

impl FramingError {
    /// Whether the decoder dropped synchronization because of this error
    pub fn lost_sync(&self) -> bool {
        !matches!(self, FramingError::BadCrc { .. })
    }
}
