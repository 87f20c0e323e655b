//! # Error Definitions
//!
//! Every failure the codec can surface. None of them are recoverable mid-stream:
//! once a read or write fails the connection must be treated as desynchronized.

use std::sync::Arc;

/// Framing failures.
#[derive(Debug, Clone)]
pub enum Error {
    /// The underlying stream failed. Behind `Arc` so the error stays `Clone`.
    Io(Arc<std::io::Error>),
    /// The stream ended in the middle of a frame.
    Truncated,
    /// The command code exceeds the one-byte length prefix.
    CodeTooLong(usize),
    /// The command code is not valid UTF-8.
    InvalidCode,
    /// The payload exceeds the configured maximum.
    PayloadTooLarge { len: u64, max: u64 },
    /// A multiplexed codec was handed a packet without a client id.
    MissingClientId,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Truncated => write!(f, "stream ended inside a frame"),
            Self::CodeTooLong(len) => {
                write!(f, "command code is {} bytes, limit is {}", len, crate::MAX_CODE_LEN)
            }
            Self::InvalidCode => write!(f, "command code is not valid UTF-8"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload is {} bytes, limit is {}", len, max)
            }
            Self::MissingClientId => write!(f, "multiplexed stream requires a client id"),
        }
    }
}

impl Error {
    /// True when the stream itself failed, as opposed to a packet being rejected
    /// before any byte of it was written.
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Truncated)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(Arc::new(e))
        }
    }
}

/// A specialized Result type for codec operations.
pub type Result<T> = std::result::Result<T, Error>;
