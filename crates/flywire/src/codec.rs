//! # Codec
//!
//! Moves packets to and from a byte stream.
//!
//! ## Invariants
//! - **Validate Before Write**: oversized codes and payloads are rejected before a
//!   single byte reaches the writer, so a failed encode never leaves half a frame.
//! - **Exact Reads**: the payload is read with a full read. A short read is
//!   `Error::Truncated`; the codec never retries or resynchronizes.
//! - **Bounded Allocation**: the declared payload length is checked against
//!   `max_payload` before the buffer is allocated.

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::BufWriter;

use crate::error::Error;
use crate::error::Result;
use crate::flag::Flag;
use crate::flag::LenWidth;
use crate::packet::Packet;

/// Longest command code the one-byte length prefix can describe.
pub const MAX_CODE_LEN: usize = u8::MAX as usize;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Both ends of a stream must agree on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Prefix every frame with a `u32` client id.
    pub multiplexed: bool,
    pub max_payload: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            multiplexed: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Checks a packet against the framing limits and picks its length width.
fn validate(packet: &Packet, config: &CodecConfig) -> Result<LenWidth> {
    if packet.code.len() > MAX_CODE_LEN {
        return Err(Error::CodeTooLong(packet.code.len()));
    }

    let len = packet.payload.len() as u64;
    if len > config.max_payload {
        return Err(Error::PayloadTooLarge { len, max: config.max_payload });
    }

    if config.multiplexed && packet.client_id.is_none() {
        return Err(Error::MissingClientId);
    }

    Ok(LenWidth::for_len(len))
}

/// Writes everything up to (not including) the payload.
fn encode_header(packet: &Packet, width: LenWidth, config: &CodecConfig, buf: &mut Vec<u8>) {
    let code = packet.code.as_bytes();
    let len = packet.payload.len() as u64;

    if config.multiplexed {
        buf.extend_from_slice(&packet.client_id.unwrap_or_default().to_be_bytes());
    }
    buf.push(packet.flag.semantic().with_width(width).byte());
    buf.extend_from_slice(&packet.seq.to_be_bytes());
    buf.push(code.len() as u8);
    buf.extend_from_slice(code);

    match width {
        LenWidth::U8 => buf.push(len as u8),
        LenWidth::U16 => buf.extend_from_slice(&(len as u16).to_be_bytes()),
        LenWidth::U32 => buf.extend_from_slice(&(len as u32).to_be_bytes()),
        LenWidth::U64 => buf.extend_from_slice(&len.to_be_bytes()),
    }
}

/// Encodes a whole frame into `buf`. On error `buf` is left untouched.
pub fn encode_into(packet: &Packet, config: &CodecConfig, buf: &mut Vec<u8>) -> Result<()> {
    let width = validate(packet, config)?;
    buf.reserve(4 + 1 + 2 + 1 + packet.code.len() + width.bytes() + packet.payload.len());
    encode_header(packet, width, config, buf);
    buf.extend_from_slice(&packet.payload);
    Ok(())
}

/// Encodes a whole frame into a fresh buffer.
pub fn encode(packet: &Packet, config: &CodecConfig) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(packet, config, &mut buf)?;
    Ok(buf)
}

/// Writing half of a framed stream.
pub struct PacketWriter<W> {
    inner: BufWriter<W>,
    config: CodecConfig,
    header: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(writer: W, config: CodecConfig) -> Self {
        Self {
            inner: BufWriter::new(writer),
            config,
            header: Vec::with_capacity(64),
        }
    }

    /// Writes one packet and flushes, so the frame reaches the stream as a unit.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let width = validate(packet, &self.config)?;

        self.header.clear();
        encode_header(packet, width, &self.config, &mut self.header);

        self.inner.write_all(&self.header).await?;
        self.inner.write_all(&packet.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes and shuts the write side down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Shuts the write side down without flushing. Buffered bytes are lost.
    ///
    /// For a stream left holding part of a frame, where a flush could block on a
    /// peer that stopped reading.
    pub async fn abort(&mut self) -> Result<()> {
        self.inner.get_mut().shutdown().await?;
        Ok(())
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

/// Reading half of a framed stream.
pub struct PacketReader<R> {
    inner: BufReader<R>,
    config: CodecConfig,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R, config: CodecConfig) -> Self {
        Self {
            inner: BufReader::new(reader),
            config,
        }
    }

    /// Reads the next packet.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    /// Ending anywhere else is `Error::Truncated`.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut first = [0u8; 1];
        if self.inner.read(&mut first).await? == 0 {
            return Ok(None);
        }

        let (client_id, flag_byte) = if self.config.multiplexed {
            let mut rest = [0u8; 3];
            self.inner.read_exact(&mut rest).await?;
            let id = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);
            (Some(id), self.inner.read_u8().await?)
        } else {
            (None, first[0])
        };

        let flag = Flag::from_byte(flag_byte);
        let seq = self.inner.read_u16().await?;

        let code_len = self.inner.read_u8().await? as usize;
        let mut code = vec![0u8; code_len];
        self.inner.read_exact(&mut code).await?;
        let code = String::from_utf8(code).map_err(|_| Error::InvalidCode)?;

        let len = match flag.width() {
            LenWidth::U8 => self.inner.read_u8().await? as u64,
            LenWidth::U16 => self.inner.read_u16().await? as u64,
            LenWidth::U32 => self.inner.read_u32().await? as u64,
            LenWidth::U64 => self.inner.read_u64().await?,
        };
        if len > self.config.max_payload {
            return Err(Error::PayloadTooLarge { len, max: self.config.max_payload });
        }

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;

        Ok(Some(Packet {
            client_id,
            flag: flag.semantic(),
            seq,
            code,
            payload: Bytes::from(payload),
        }))
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}
