//! # Error Definitions
//!
//! What a caller of `call`, `ping` or `send_message` can observe. Every cause is
//! its own variant so callers can branch on it: a timeout is never confused with
//! a remote rejection or a dead connection.

use std::sync::Arc;

use crate::router::RouteError;
use crate::serializer::SerializeError;
use crate::transport;

/// Error codes with a fixed meaning on the wire.
pub mod codes {
    /// No route is registered for the command.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// The handler panicked; the panic was contained on the remote side.
    pub const HANDLER_PANIC: &str = "HANDLER_PANIC";
    /// The request payload could not be decoded into the handler's message type.
    pub const BAD_PAYLOAD: &str = "BAD_PAYLOAD";
    /// The handler's reply could not be encoded.
    pub const INTERNAL: &str = "INTERNAL";
}

/// An error a handler returns to its caller. Only the code crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyError {
    code: String,
}

impl ReplyError {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}

impl std::error::Error for ReplyError {}

impl From<&str> for ReplyError {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for ReplyError {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

/// Session-level failures.
#[derive(Debug, Clone)]
pub enum Error {
    /// The local deadline passed before a reply arrived.
    Timeout,
    /// The peer has no handler for the command.
    NotFound(String),
    /// The peer's handler for the command panicked.
    HandlerPanic(String),
    /// The peer's handler returned an error code.
    Remote(ReplyError),
    /// A message could not be marshalled or unmarshalled.
    Serialization(SerializeError),
    /// The session is gone. Every in-flight call of a dying session ends here.
    TransportClosed(String),
    /// The stream failed while writing.
    Io(Arc<std::io::Error>),
    /// A frame broke the wire contract (oversized code or payload, truncated read).
    Protocol(flywire::Error),
    /// Every usable sequence number is in flight, or the pending bound is reached.
    TooManyPending,
    /// A handler could not be registered.
    Route(RouteError),
}

impl Error {
    /// Interprets the payload of an error-flagged response to a call on `code`.
    pub(crate) fn from_remote(code: &str, payload: &[u8]) -> Self {
        let reply = String::from_utf8_lossy(payload);
        match reply.as_ref() {
            codes::NOT_FOUND => Self::NotFound(code.to_string()),
            codes::HANDLER_PANIC => Self::HandlerPanic(code.to_string()),
            _ => Self::Remote(ReplyError::new(reply.into_owned())),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::TransportClosed(_))
    }

    /// The remote error code, if the peer rejected the call.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote(e) => Some(e.code()),
            Self::NotFound(_) => Some(codes::NOT_FOUND),
            Self::HandlerPanic(_) => Some(codes::HANDLER_PANIC),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "call timed out"),
            Self::NotFound(code) => write!(f, "no handler for command '{}'", code),
            Self::HandlerPanic(code) => write!(f, "handler for command '{}' panicked", code),
            Self::Remote(e) => write!(f, "remote error: {}", e),
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::TransportClosed(reason) => write!(f, "transport closed: {}", reason),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(e) => write!(f, "protocol violation: {}", e),
            Self::TooManyPending => write!(f, "too many calls in flight"),
            Self::Route(e) => write!(f, "route error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::Io(e) => Some(e.as_ref()),
            Self::Protocol(e) => Some(e),
            Self::Route(e) => Some(e),
            _ => None,
        }
    }
}

impl From<flywire::Error> for Error {
    fn from(e: flywire::Error) -> Self {
        match e {
            flywire::Error::Io(io) => Self::Io(io),
            other => Self::Protocol(other),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        match e {
            transport::Error::Closed => Self::TransportClosed("transport is closed".into()),
            transport::Error::Torn => Self::TransportClosed("stream holds a partial frame".into()),
            transport::Error::Wire(w) => w.into(),
        }
    }
}

impl From<SerializeError> for Error {
    fn from(e: SerializeError) -> Self {
        Self::Serialization(e)
    }
}

impl From<RouteError> for Error {
    fn from(e: RouteError) -> Self {
        Self::Route(e)
    }
}

impl From<ReplyError> for Error {
    fn from(e: ReplyError) -> Self {
        Self::Remote(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
