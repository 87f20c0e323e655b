//! # Flywire
//!
//! The binary framing layer of flyrpc: one [`Packet`] in, one frame out.
//!
//! ## Format
//!
//! ```text
//! [client_id: u32]? [flag: u8] [seq: u16] [code_len: u8] [code] [len: 1|2|4|8] [payload]
//! ```
//!
//! All integers are Big-Endian. `client_id` is present only on multiplexed streams.
//! The payload length uses the narrowest width that fits; the chosen width is
//! recorded in the flag byte (see [`flag`]).
//!
//! The codec knows nothing about what the payload means or which packets need
//! answers. Those decisions live in `flyrpc`.

pub mod codec;
pub mod error;
pub mod flag;
pub mod packet;

pub use codec::CodecConfig;
pub use codec::DEFAULT_MAX_PAYLOAD;
pub use codec::MAX_CODE_LEN;
pub use codec::PacketReader;
pub use codec::PacketWriter;
pub use codec::encode;
pub use codec::encode_into;
pub use error::Error;
pub use error::Result;
pub use flag::Flag;
pub use flag::Kind;
pub use flag::LenWidth;
pub use packet::Packet;
