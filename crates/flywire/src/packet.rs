//! # Packets
//!
//! The unit of wire transfer. A packet never interprets its payload; the bytes
//! are already serialized by the time they get here.

use bytes::Bytes;

use crate::flag::Flag;
use crate::flag::Kind;

/// One framed unit: flag, sequence, command code, payload.
///
/// `flag` never carries length-width bits; the codec adds them on encode and
/// strips them on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Present only on multiplexed transports.
    pub client_id: Option<u32>,
    pub flag: Flag,
    /// Correlation number, scoped per sub-protocol.
    pub seq: u16,
    /// Handler identifier. Empty for keepalive packets.
    pub code: String,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(flag: Flag, seq: u16, code: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            client_id: None,
            flag: flag.semantic(),
            seq,
            code: code.into(),
            payload: payload.into(),
        }
    }

    /// A call that expects exactly one response.
    pub fn request(seq: u16, code: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(Flag::request(), seq, code, payload)
    }

    /// A fire-and-forget send.
    pub fn message(seq: u16, code: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(Flag::message(), seq, code, payload)
    }

    /// A successful response. An empty payload is a bare acknowledgement.
    pub fn response(seq: u16, code: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(Flag::response(), seq, code, payload)
    }

    /// An error response carrying `error_code` as its payload.
    pub fn error(seq: u16, code: impl Into<String>, error_code: &str) -> Self {
        Self::new(Flag::error_response(), seq, code, Bytes::copy_from_slice(error_code.as_bytes()))
    }

    pub fn ping(seq: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(Flag::ping(), seq, String::new(), payload)
    }

    pub fn pong(seq: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(Flag::pong(), seq, String::new(), payload)
    }

    pub fn with_client_id(mut self, client_id: Option<u32>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn kind(&self) -> Kind {
        self.flag.kind()
    }

    /// Payload length as written in the length field.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True for RPC requests, which must be answered by exactly one response.
    pub fn expects_reply(&self) -> bool {
        self.flag.is_request()
    }
}
