//! # Server
//!
//! Accepts connections and gives each one its own [`Context`] over a shared
//! [`Router`]. Client ids are handed out in accept order and never reused.
//!
//! On a multiplexed stream the assigned id tags what the server itself sends:
//! its calls, messages and pings carry the id from [`Context::client_id`], not
//! whatever id the peer put on its own packets. Replies echo the id of the
//! request they answer.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::router::Router;
use crate::transport::StreamTransport;
use crate::transport::Transport;

type ConnectHook = Arc<dyn Fn(&Context) + Send + Sync>;

pub struct Server {
    router: Arc<Router>,
    config: Config,
    sessions: Arc<DashMap<u32, Context>>,
    next_client_id: AtomicU32,
    on_connect: Option<ConnectHook>,
}

impl Server {
    pub fn new(router: Arc<Router>, config: Config) -> Self {
        Self {
            router,
            config,
            sessions: Arc::new(DashMap::new()),
            next_client_id: AtomicU32::new(1),
            on_connect: None,
        }
    }

    /// Runs `hook` for every new session before its first packet is read.
    pub fn on_connect(mut self, hook: impl Fn(&Context) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }
        loop {
            let (stream, peer) = listener.accept().await.map_err(|e| Error::Io(Arc::new(e)))?;
            let ctx = self.accept_tcp(stream);
            tracing::debug!(%peer, client_id = ?ctx.client_id(), "accepted");
        }
    }

    pub fn accept_tcp(&self, stream: TcpStream) -> Context {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        self.accept_transport(Arc::new(StreamTransport::tcp(stream, self.config.codec())))
    }

    /// Serves one already-established duplex stream.
    pub fn accept_stream<S>(&self, stream: S) -> Context
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.accept_transport(Arc::new(StreamTransport::split(stream, self.config.codec())))
    }

    pub fn accept_transport(&self, transport: Arc<dyn Transport>) -> Context {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        let router = self.router.clone();
        let ctx = Context::with_client_id(client_id, transport, router, self.config.clone());
        // inserted first: on_close runs at once if the peer is already gone
        self.sessions.insert(client_id, ctx.clone());

        let sessions = Arc::downgrade(&self.sessions);
        ctx.on_close(move |ctx| {
            if let (Some(sessions), Some(id)) = (sessions.upgrade(), ctx.client_id()) {
                sessions.remove(&id);
            }
        });

        if let Some(hook) = &self.on_connect {
            hook(&ctx);
        }
        ctx
    }

    pub fn session(&self, client_id: u32) -> Option<Context> {
        self.sessions.get(&client_id).map(|s| s.value().clone())
    }

    /// Ids of the live sessions, in ascending order.
    pub fn client_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sessions.iter().map(|s| *s.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sends a fire-and-forget message to each listed client. Returns how many
    /// sends succeeded; unknown or failing clients are skipped.
    pub async fn broadcast<T>(&self, client_ids: &[u32], code: &str, msg: &T) -> Result<usize>
    where
        T: Serialize + ?Sized,
    {
        let payload = self.config.serializer.marshal(msg)?;
        let mut delivered = 0;
        for id in client_ids {
            let Some(ctx) = self.session(*id) else {
                continue;
            };
            match ctx.send_raw(code, payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(client_id = id, error = %e, "broadcast skipped client"),
            }
        }
        Ok(delivered)
    }

    /// Closes every live session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Context> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for ctx in sessions {
            if let Err(e) = ctx.close().await {
                tracing::debug!(client_id = ?ctx.client_id(), error = %e, "close failed");
            }
        }
    }
}
