//! # Flyrpc
//!
//! Bidirectional RPC over one byte stream. Either side of a connection can call
//! the other, send fire-and-forget messages, and ping; replies are matched to
//! calls by sequence number, so many calls can be in flight at once and complete
//! in any order.
//!
//! ```ignore
//! let router = Arc::new(Router::new());
//! router.add_route("echo", |Msg(user): Msg<User>| async move { Msg(user) })?;
//!
//! let ctx = Context::connect("127.0.0.1:7000", router, Config::default()).await?;
//! let user: User = ctx.call("echo", &User { id: 123, name: "abc".into() }).await?;
//! ```
//!
//! Framing lives in `flywire`; this crate adds correlation, routing and sessions.

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
mod pending;
pub mod router;
pub mod serializer;
pub mod server;
pub mod transport;

pub use config::Config;
pub use context::Context;
pub use error::Error;
pub use error::ReplyError;
pub use error::Result;
pub use error::codes;
pub use handler::Msg;
pub use handler::Payload;
pub use router::Router;
pub use serializer::Serializer;
pub use server::Server;
pub use transport::ChannelTransport;
pub use transport::StreamTransport;
pub use transport::Transport;

pub use flywire::Packet;

#[cfg(test)]
mod tests;
