//! # Session Context
//!
//! One [`Context`] per connection. It owns the transport, correlates replies with
//! the calls that are waiting for them, and hands inbound requests to the router.
//!
//! ## Lifecycle
//! `Context::new` spawns a pump that reads packets and feeds them to
//! [`Context::emit_packet`]. When the stream ends or fails, the session closes:
//! every waiting call and ping resolves with `Error::TransportClosed` and the close
//! callbacks run once. A failed write closes the session the same way; a packet
//! rejected before any byte was written does not.
//!
//! ## Invariants
//! - **Late Replies Are Dropped**: a reply whose call already timed out finds no
//!   pending entry and is discarded.
//! - **Handlers Never Block The Pump**: each inbound request runs in its own task.
//! - **One Deadline Per Call**: the timeout covers writing the request as well as
//!   waiting for the reply. A peer that stops reading cannot hold a caller past it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use flywire::Kind;
use flywire::MAX_CODE_LEN;
use flywire::Packet;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::pending::Pending;
use crate::pending::PendingTable;
use crate::router::Router;
use crate::serializer::Serializer;
use crate::transport;
use crate::transport::StreamTransport;
use crate::transport::Transport;

type CloseCallback = Box<dyn FnOnce(&Context) + Send>;

type SessionValues = anymap::Map<dyn anymap::any::Any + Send + Sync>;

struct Inner {
    client_id: Option<u32>,
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    config: Config,
    calls: PendingTable<Result<Bytes>>,
    pings: PendingTable<Result<()>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    on_close: Mutex<Vec<CloseCallback>>,
    values: Mutex<SessionValues>,
}

/// A handle to one session. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Starts a session over `transport` and spawns its read pump.
    pub fn new(transport: Arc<dyn Transport>, router: Arc<Router>, config: Config) -> Self {
        let ctx = Self::build(None, transport, router, config);
        ctx.spawn_pump();
        ctx
    }

    /// Like [`Context::new`], tagging every outgoing packet with `client_id`.
    pub fn with_client_id(
        client_id: u32,
        transport: Arc<dyn Transport>,
        router: Arc<Router>,
        config: Config,
    ) -> Self {
        let ctx = Self::build(Some(client_id), transport, router, config);
        ctx.spawn_pump();
        ctx
    }

    /// A session with no pump. Inbound packets must be fed through `emit_packet`.
    pub fn without_pump(
        transport: Arc<dyn Transport>,
        router: Arc<Router>,
        config: Config,
    ) -> Self {
        Self::build(None, transport, router, config)
    }

    /// Dials a TCP peer and starts a session on the connection.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        router: Arc<Router>,
        config: Config,
    ) -> Result<Self> {
        let transport = StreamTransport::connect(addr, config.codec()).await?;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        tracing::debug!("connected");
        Ok(Self::new(transport, router, config))
    }

    fn build(
        client_id: Option<u32>,
        transport: Arc<dyn Transport>,
        router: Arc<Router>,
        config: Config,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client_id,
                transport,
                router,
                calls: PendingTable::new(config.max_pending),
                pings: PendingTable::new(config.max_pending),
                config,
                closed: AtomicBool::new(false),
                shutdown,
                on_close: Mutex::new(Vec::new()),
                values: Mutex::new(SessionValues::new()),
            }),
        }
    }

    fn spawn_pump(&self) {
        let ctx = self.clone();
        let mut stop = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = stop.changed() => break None,
                    next = ctx.inner.transport.recv() => match next {
                        Ok(Some(packet)) => ctx.emit_packet(packet),
                        Ok(None) => break Some("peer disconnected".to_string()),
                        Err(e) => {
                            let client_id = ctx.inner.client_id;
                            tracing::warn!(client_id = ?client_id, error = %e, "read failed");
                            break Some(format!("read failed: {}", e));
                        }
                    },
                }
            };

            if let Some(reason) = reason {
                ctx.teardown(reason);
                ctx.close_transport().await;
            }
        });
    }

    pub fn client_id(&self) -> Option<u32> {
        self.inner.client_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn serializer(&self) -> Serializer {
        self.inner.config.serializer
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn pending_pings(&self) -> usize {
        self.inner.pings.len()
    }

    /// Runs `callback` once when the session closes, or now if it already has.
    pub fn on_close(&self, callback: impl FnOnce(&Context) + Send + 'static) {
        let mut callbacks = self.inner.on_close.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(callbacks);
            callback(self);
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    // ------------------------------------------------------------------
    //  Session values
    // ------------------------------------------------------------------

    /// Stores a value for the lifetime of the session, one per type.
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.values().insert(value)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.values().get::<T>().cloned()
    }

    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<T> {
        self.values().remove::<T>()
    }

    /// Runs `f` on the stored value in place, under the session's value lock.
    pub fn with_value<T, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R
    where
        T: Send + Sync + 'static,
    {
        f(self.values().get_mut::<T>())
    }

    fn values(&self) -> std::sync::MutexGuard<'_, SessionValues> {
        self.inner.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    //  Outbound
    // ------------------------------------------------------------------

    /// Calls `code` with the configured timeout and decodes the reply.
    pub async fn call<Req, Resp>(&self, code: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_timeout(code, req, self.inner.config.call_timeout).await
    }

    pub async fn call_with_timeout<Req, Resp>(
        &self,
        code: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let serializer = self.serializer();
        let payload = serializer.marshal(req)?;
        let reply = self.call_raw(code, payload, timeout).await?;
        Ok(serializer.unmarshal(&reply)?)
    }

    /// Calls `code` and only waits for the acknowledgement.
    pub async fn call_ack<Req>(&self, code: &str, req: &Req) -> Result<()>
    where
        Req: Serialize + ?Sized,
    {
        let payload = self.serializer().marshal(req)?;
        self.call_raw(code, payload, self.inner.config.call_timeout).await?;
        Ok(())
    }

    /// Sends a request and waits for the reply payload.
    ///
    /// `timeout` bounds the whole call, including the write.
    pub async fn call_raw(&self, code: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        check_code(code)?;
        self.ensure_open()?;

        let pending = self.inner.calls.register()?;
        // close may have drained the table between the check and the insert
        if self.is_closed() {
            return Err(closed());
        }

        let packet = Packet::request(pending.seq(), code, payload);
        self.write_before(&packet.with_client_id(self.inner.client_id), deadline).await?;
        wait(pending, deadline).await
    }

    /// Sends a fire-and-forget message. The peer never replies.
    pub async fn send_message<T>(&self, code: &str, msg: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.serializer().marshal(msg)?;
        self.send_raw(code, payload).await
    }

    pub async fn send_raw(&self, code: &str, payload: Bytes) -> Result<()> {
        check_code(code)?;
        self.ensure_open()?;

        let seq = self.inner.calls.next_seq();
        let packet = Packet::message(seq, code, payload).with_client_id(self.inner.client_id);
        self.write(&packet).await
    }

    /// Sends a ping carrying `payload_len` zero bytes and waits for the echo.
    ///
    /// `timeout` bounds the whole round trip, including the write.
    pub async fn ping(&self, payload_len: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.ensure_open()?;

        let pending = self.inner.pings.register()?;
        if self.is_closed() {
            return Err(closed());
        }

        let packet = Packet::ping(pending.seq(), vec![0u8; payload_len]);
        self.write_before(&packet.with_client_id(self.inner.client_id), deadline).await?;
        wait(pending, deadline).await
    }

    /// [`Context::ping`] with the session's `ping_timeout`.
    pub async fn ping_default(&self, payload_len: usize) -> Result<()> {
        self.ping(payload_len, self.inner.config.ping_timeout).await
    }

    /// Writes one packet. A stream failure closes the session.
    async fn write(&self, packet: &Packet) -> Result<()> {
        let Err(e) = self.inner.transport.send(packet).await else {
            return Ok(());
        };
        if is_fatal(&e) {
            tracing::warn!(client_id = ?self.inner.client_id, error = %e, "write failed");
            self.teardown(format!("write failed: {}", e));
            self.close_transport().await;
        }
        Err(e.into())
    }

    async fn write_before(&self, packet: &Packet, deadline: Instant) -> Result<()> {
        match tokio::time::timeout_at(deadline, self.write(packet)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(seq = packet.seq, "write did not finish before the deadline");
                if self.inner.transport.is_torn() {
                    self.teardown("write cut off mid-frame".to_string());
                    self.close_transport().await;
                }
                Err(Error::Timeout)
            }
        }
    }

    // ------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------

    /// Routes one inbound packet. Never blocks: handlers and echoes run in
    /// their own tasks.
    pub fn emit_packet(&self, packet: Packet) {
        match packet.kind() {
            Kind::Rpc if packet.flag.is_response() => self.complete_call(packet),
            Kind::Rpc | Kind::Message => {
                let ctx = self.clone();
                tokio::spawn(async move { ctx.dispatch(packet).await });
            }
            Kind::Ping if packet.flag.is_ping() => {
                let pong = Packet::pong(packet.seq, packet.payload);
                let pong = pong.with_client_id(self.inner.client_id);
                let ctx = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctx.write(&pong).await {
                        tracing::debug!(seq = pong.seq, error = %e, "pong not sent");
                    }
                });
            }
            Kind::Ping if packet.flag.is_pong() => {
                if !self.inner.pings.complete(packet.seq, Ok(())) {
                    tracing::debug!(seq = packet.seq, "dropping unmatched pong");
                }
            }
            _ => {
                let flag = packet.flag;
                tracing::debug!(flag = ?flag, seq = packet.seq, "dropping unsupported packet");
            }
        }
    }

    fn complete_call(&self, packet: Packet) {
        let result = if packet.flag.is_error() {
            Err(Error::from_remote(&packet.code, &packet.payload))
        } else {
            Ok(packet.payload)
        };

        if !self.inner.calls.complete(packet.seq, result) {
            let seq = packet.seq;
            tracing::warn!(code = %packet.code, seq, "dropping reply with no pending call");
        }
    }

    async fn dispatch(&self, packet: Packet) {
        let Some(reply) = self.inner.router.dispatch(self, packet).await else {
            return;
        };
        if let Err(e) = self.write(&reply).await {
            tracing::warn!(code = %reply.code, seq = reply.seq, error = %e, "reply not sent");
        }
    }

    // ------------------------------------------------------------------
    //  Teardown
    // ------------------------------------------------------------------

    /// Closes the session and its transport. Calling it again is harmless.
    pub async fn close(&self) -> Result<()> {
        self.teardown("closed locally".to_string());
        self.inner.transport.close().await?;
        Ok(())
    }

    async fn close_transport(&self) {
        if let Err(e) = self.inner.transport.close().await {
            tracing::debug!(error = %e, "transport close failed");
        }
    }

    fn teardown(&self, reason: String) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(client_id = ?self.inner.client_id, reason = %reason, "session closed");

        self.inner.shutdown.send_replace(true);
        self.inner.calls.drain(|| Err(Error::TransportClosed(reason.clone())));
        self.inner.pings.drain(|| Err(Error::TransportClosed(reason.clone())));

        let callbacks = std::mem::take(
            &mut *self.inner.on_close.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback(self);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("client_id", &self.inner.client_id)
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

fn closed() -> Error {
    Error::TransportClosed("session is closed".into())
}

/// Whether a send failure leaves the stream unusable. Packets rejected before
/// any byte was written are not.
fn is_fatal(e: &transport::Error) -> bool {
    match e {
        transport::Error::Closed | transport::Error::Torn => true,
        transport::Error::Wire(w) => w.is_stream_failure(),
    }
}

fn check_code(code: &str) -> Result<()> {
    if code.len() > MAX_CODE_LEN {
        return Err(Error::Protocol(flywire::Error::CodeTooLong(code.len())));
    }
    Ok(())
}

/// Waits for a pending entry to resolve or for the deadline.
///
/// On timeout the entry is claimed here. If the reply (or teardown) claimed it
/// first, its value is already on the way and is returned instead. Dropping the
/// future early removes the entry.
async fn wait<T>(mut pending: Pending<'_, Result<T>>, deadline: Instant) -> Result<T> {
    let outcome = tokio::time::timeout_at(deadline, pending.receiver()).await;
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(closed()),
        Err(_) if pending.cancel() => Err(Error::Timeout),
        Err(_) => pending.receiver().await.unwrap_or_else(|_| Err(closed())),
    }
}
