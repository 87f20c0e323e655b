//! # Transport Abstraction
//!
//! A minimal, async interface for moving packets between peers.
//!
//! ## Philosophy
//!
//! - **Packet-Oriented**: a transport moves whole [`Packet`]s. It knows nothing
//!   about sequence numbers, replies or payload encodings.
//! - **Full Duplex**: `send` and `recv` may run concurrently from different tasks.
//!   Correlation of replies is built on top of this, not defined here.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use flywire::CodecConfig;
use flywire::Packet;
use flywire::PacketReader;
use flywire::PacketWriter;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The transport was closed, locally or by the peer.
    Closed,
    /// An earlier send was cut off mid-frame. Nothing more can be framed on
    /// this stream.
    Torn,
    /// The framing layer failed.
    Wire(flywire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Transport closed"),
            Self::Torn => write!(f, "Stream holds a partial frame"),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<flywire::Error> for Error {
    fn from(e: flywire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Wire(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional packet pipe.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one packet. Concurrent senders never interleave frames.
    async fn send(&self, packet: &Packet) -> Result<()>;

    /// Receives the next packet.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the peer has gone away cleanly.
    /// - Returns `Err` when the stream can no longer be trusted.
    async fn recv(&self) -> Result<Option<Packet>>;

    /// Stops sending. The peer observes end of stream.
    async fn close(&self) -> Result<()>;

    /// True once a send was cancelled or failed partway through a frame.
    fn is_torn(&self) -> bool {
        false
    }
}

/// A transport over any byte stream, framed by `flywire`.
///
/// A send that is cancelled or fails after it started writing leaves the stream
/// torn: later sends fail with [`Error::Torn`] and `close` skips the flush.
pub struct StreamTransport<R, W> {
    reader: Mutex<PacketReader<R>>,
    writer: Mutex<PacketWriter<W>>,
    closed: AtomicBool,
    torn: AtomicBool,
}

/// Marks the stream torn unless the write it guards finishes.
struct WriteGuard<'a> {
    torn: &'a AtomicBool,
    done: bool,
}

impl WriteGuard<'_> {
    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.torn.store(true, Ordering::Release);
        }
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, config: CodecConfig) -> Self {
        Self {
            reader: Mutex::new(PacketReader::new(reader, config)),
            writer: Mutex::new(PacketWriter::new(writer, config)),
            closed: AtomicBool::new(false),
            torn: AtomicBool::new(false),
        }
    }
}

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    pub fn tcp(stream: TcpStream, config: CodecConfig) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, config)
    }

    pub async fn connect(addr: impl ToSocketAddrs, config: CodecConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::tcp(stream, config))
    }
}

impl<S> StreamTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Frames a single duplex stream, e.g. `tokio::io::duplex` or a Unix socket.
    pub fn split(stream: S, config: CodecConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, config)
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, packet: &Packet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut writer = self.writer.lock().await;
        if self.is_torn() {
            return Err(Error::Torn);
        }

        let guard = WriteGuard { torn: &self.torn, done: false };
        match writer.write_packet(packet).await {
            Ok(()) => {
                guard.finish();
                Ok(())
            }
            // rejected before anything was written
            Err(e) if !e.is_stream_failure() => {
                guard.finish();
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recv(&self) -> Result<Option<Packet>> {
        let mut reader = self.reader.lock().await;
        Ok(reader.read_packet().await?)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        let shutdown = if self.is_torn() { writer.abort().await } else { writer.shutdown().await };
        match shutdown {
            Ok(()) => Ok(()),
            // the peer beat us to it
            Err(flywire::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_torn(&self) -> bool {
        self.torn.load(Ordering::Acquire)
    }
}

/// An in-process transport over tokio mpsc channels.
///
/// Packets sent on one end appear on the other end's `recv`, unencoded.
pub struct ChannelTransport {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Packet>>>,
}

impl ChannelTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: std::sync::Mutex::new(Some(tx_a)),
            rx: Arc::new(Mutex::new(rx_b)),
        };

        let b = Self {
            tx: std::sync::Mutex::new(Some(tx_b)),
            rx: Arc::new(Mutex::new(rx_a)),
        };

        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Packet>> {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let tx = self.sender().ok_or(Error::Closed)?;
        tx.send(packet.clone()).map_err(|_| Error::Closed)
    }

    async fn recv(&self) -> Result<Option<Packet>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }
}
