use std::{io, sync::Arc};
use thiserror::Error;

/// Convenient type alias for `Result<T, SmuxError>`.
pub type Result<T> = std::result::Result<T, SmuxError>;

/// Error types for the smux library.
///
/// `SmuxError` is `Clone` so that the single cause recorded when a session
/// dies can be reported by every stream of that session.
#[derive(Debug, Clone, Error)]
pub enum SmuxError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Carrier reached end of stream")]
    CarrierEof,

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("Carrier ended in the middle of a frame")]
    Truncated,

    #[error("Invalid protocol version: {actual} (expected {expected})")]
    InvalidVersion { expected: u8, actual: u8 },

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Stream already exists: {0}")]
    DuplicateStream(u32),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(u32),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Flow control violated on stream {0}")]
    FlowControlViolation(u32),

    #[error("Keep-alive timeout")]
    KeepAliveTimeout,

    #[error("Stream closed")]
    Closed,

    #[error("Session closed")]
    SessionClosed,

    #[error("End of stream")]
    EndOfStream,

    #[error("Operation timed out")]
    Timeout,

    #[error("Stream IDs exhausted")]
    StreamsExhausted,
}

impl From<io::Error> for SmuxError {
    fn from(err: io::Error) -> Self {
        SmuxError::Io(Arc::new(err))
    }
}

impl From<SmuxError> for io::Error {
    fn from(err: SmuxError) -> Self {
        match err {
            SmuxError::Io(inner) => io::Error::new(inner.kind(), SmuxError::Io(inner)),
            SmuxError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            SmuxError::Closed | SmuxError::SessionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, err)
            }
            SmuxError::EndOfStream | SmuxError::CarrierEof | SmuxError::Truncated => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err)
            }
            SmuxError::InvalidConfig(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}

impl SmuxError {
    /// The peer broke the wire contract.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SmuxError::InvalidVersion { .. }
                | SmuxError::UnknownCommand(_)
                | SmuxError::FrameTooLarge { .. }
                | SmuxError::DuplicateStream(_)
                | SmuxError::InvalidStreamId(_)
                | SmuxError::ProtocolViolation(_)
        )
    }

    /// The underlying connection ended or failed.
    pub fn is_carrier_error(&self) -> bool {
        matches!(
            self,
            SmuxError::CarrierEof | SmuxError::Io(_) | SmuxError::Truncated
        )
    }

    /// Errors that end the whole session when observed by a background task.
    pub fn is_fatal(&self) -> bool {
        self.is_protocol_error()
            || self.is_carrier_error()
            || matches!(
                self,
                SmuxError::FlowControlViolation(_)
                    | SmuxError::KeepAliveTimeout
                    | SmuxError::SessionClosed
            )
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            SmuxError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            SmuxError::Timeout => true,
            _ => false,
        }
    }
}
