//! # Flag Byte Layout
//!
//! The first byte of every frame. It is a fixed contract between peers:
//!
//! ```text
//!   7 6   5 4   3 2 1 0
//!  [kind][width][ bits ]
//! ```
//!
//! - **kind**: `11` RPC, `10` Ping, `01` Hello, `00` Message.
//! - **width**: how many bytes encode the payload length (`00`=1, `01`=2, `10`=4, `11`=8).
//!   Owned by the codec; callers never set it.
//! - **bits**: per-kind flags. RPC uses `RPC_RESPONSE` and `RPC_ERROR`,
//!   Ping uses `PING` and `PONG`.

const KIND_MASK: u8 = 0b1100_0000;
const WIDTH_MASK: u8 = 0b0011_0000;
const WIDTH_SHIFT: u8 = 4;
const BITS_MASK: u8 = 0b0000_1111;

/// RPC: the packet answers an earlier request.
pub const RPC_RESPONSE: u8 = 0x01;
/// RPC: the response carries an error code instead of a message.
pub const RPC_ERROR: u8 = 0x02;
/// Ping: liveness check, must be echoed.
pub const PING: u8 = 0x01;
/// Ping: echo of a liveness check.
pub const PONG: u8 = 0x02;

/// The sub-protocol selected by the top two bits.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Fire-and-forget send. Never answered.
    Message = 0x00,
    /// Reserved handshake.
    Hello = 0x40,
    /// Keepalive checks.
    Ping = 0x80,
    /// Requests and their responses.
    Rpc = 0xC0,
}

impl Kind {
    fn from_bits(b: u8) -> Self {
        match b & KIND_MASK {
            0xC0 => Kind::Rpc,
            0x80 => Kind::Ping,
            0x40 => Kind::Hello,
            _ => Kind::Message,
        }
    }
}

/// Byte width of the payload length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenWidth {
    U8,
    U16,
    U32,
    U64,
}

impl LenWidth {
    /// The narrowest width that can hold `len`.
    pub fn for_len(len: u64) -> Self {
        if len <= u8::MAX as u64 {
            LenWidth::U8
        } else if len <= u16::MAX as u64 {
            LenWidth::U16
        } else if len <= u32::MAX as u64 {
            LenWidth::U32
        } else {
            LenWidth::U64
        }
    }

    /// Number of length bytes that follow the code.
    pub fn bytes(self) -> usize {
        match self {
            LenWidth::U8 => 1,
            LenWidth::U16 => 2,
            LenWidth::U32 => 4,
            LenWidth::U64 => 8,
        }
    }

    fn to_bits(self) -> u8 {
        let n = match self {
            LenWidth::U8 => 0,
            LenWidth::U16 => 1,
            LenWidth::U32 => 2,
            LenWidth::U64 => 3,
        };
        n << WIDTH_SHIFT
    }

    fn from_bits(b: u8) -> Self {
        match (b & WIDTH_MASK) >> WIDTH_SHIFT {
            0 => LenWidth::U8,
            1 => LenWidth::U16,
            2 => LenWidth::U32,
            _ => LenWidth::U64,
        }
    }
}

/// A frame's flag byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flag(u8);

impl Flag {
    /// Wraps a raw byte as read from the wire.
    pub const fn from_byte(b: u8) -> Self {
        Flag(b)
    }

    /// The raw byte.
    pub const fn byte(self) -> u8 {
        self.0
    }

    /// Builds a flag from a kind and its per-kind bits. Width is left at zero.
    pub const fn new(kind: Kind, bits: u8) -> Self {
        Flag(kind as u8 | (bits & BITS_MASK))
    }

    pub const fn request() -> Self {
        Self::new(Kind::Rpc, 0)
    }

    pub const fn response() -> Self {
        Self::new(Kind::Rpc, RPC_RESPONSE)
    }

    pub const fn error_response() -> Self {
        Self::new(Kind::Rpc, RPC_RESPONSE | RPC_ERROR)
    }

    pub const fn message() -> Self {
        Self::new(Kind::Message, 0)
    }

    pub const fn ping() -> Self {
        Self::new(Kind::Ping, PING)
    }

    pub const fn pong() -> Self {
        Self::new(Kind::Ping, PONG)
    }

    pub const fn hello() -> Self {
        Self::new(Kind::Hello, 0)
    }

    pub fn kind(self) -> Kind {
        Kind::from_bits(self.0)
    }

    /// The low nibble.
    pub fn bits(self) -> u8 {
        self.0 & BITS_MASK
    }

    pub fn width(self) -> LenWidth {
        LenWidth::from_bits(self.0)
    }

    /// Replaces the width bits, leaving kind and per-kind bits intact.
    pub fn with_width(self, width: LenWidth) -> Self {
        Flag((self.0 & !WIDTH_MASK) | width.to_bits())
    }

    /// The flag with width bits cleared, which is what two peers compare.
    pub fn semantic(self) -> Self {
        Flag(self.0 & !WIDTH_MASK)
    }

    pub fn is_response(self) -> bool {
        self.kind() == Kind::Rpc && self.bits() & RPC_RESPONSE != 0
    }

    pub fn is_error(self) -> bool {
        self.kind() == Kind::Rpc && self.bits() & RPC_ERROR != 0
    }

    /// An RPC packet that expects exactly one response.
    pub fn is_request(self) -> bool {
        self.kind() == Kind::Rpc && self.bits() & RPC_RESPONSE == 0
    }

    pub fn is_ping(self) -> bool {
        self.kind() == Kind::Ping && self.bits() & PING != 0
    }

    pub fn is_pong(self) -> bool {
        self.kind() == Kind::Ping && self.bits() & PONG != 0
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flag({:?}, bits={:#06b}, width={:?})", self.kind(), self.bits(), self.width())
    }
}
