//! # Handlers
//!
//! Any async function whose parameters are extractors and whose output is one of
//! the accepted shapes can serve a command:
//!
//! ```ignore
//! router.add_route("echo", |Msg(user): Msg<User>| async move { Msg(user) })?;
//! router.add_route("audit", |ctx: Context, packet: Packet| async move { ... })?;
//! ```
//!
//! ## Parameters
//! At most one of each: [`Context`], [`Packet`], [`Payload`] (raw bytes) and
//! [`Msg<T>`] (the payload decoded with the session's serializer).
//!
//! ## Outputs
//! `()`, `Msg<T>`, `Result<(), E>` or `Result<Msg<T>, E>` where `E: Into<ReplyError>`.
//! The shape is known when the route is registered; nothing is inspected per call.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use flywire::Packet;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::Context;
use crate::error::ReplyError;
use crate::error::codes;
use crate::serializer::SerializeError;
use crate::serializer::Serializer;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// What a handler parameter is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Context,
    Packet,
    Payload,
    Message,
}

/// What a handler hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputShape {
    Nothing,
    Message,
    Error,
    MessageOrError,
}

impl OutputShape {
    pub fn has_message(self) -> bool {
        matches!(self, Self::Message | Self::MessageOrError)
    }

    pub fn has_error(self) -> bool {
        matches!(self, Self::Error | Self::MessageOrError)
    }
}

/// A handler's parameter kinds and output shape, fixed at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub inputs: Vec<ArgKind>,
    pub output: OutputShape,
}

/// A successful handler result, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Message(Bytes),
}

/// Why a dispatch produced no successful outcome.
#[derive(Debug, Clone)]
pub enum DispatchError {
    NotFound,
    BadPayload(SerializeError),
    Encode(SerializeError),
    Panic { message: String, backtrace: String },
    Handler(ReplyError),
}

impl DispatchError {
    /// The code sent back to the caller.
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound => codes::NOT_FOUND,
            Self::BadPayload(_) => codes::BAD_PAYLOAD,
            Self::Encode(_) => codes::INTERNAL,
            Self::Panic { .. } => codes::HANDLER_PANIC,
            Self::Handler(e) => e.code(),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no route"),
            Self::BadPayload(e) => write!(f, "bad payload: {}", e),
            Self::Encode(e) => write!(f, "reply encode failed: {}", e),
            Self::Panic { message, .. } => write!(f, "handler panicked: {}", message),
            Self::Handler(e) => write!(f, "handler error: {}", e),
        }
    }
}

impl std::error::Error for DispatchError {}

/// An inbound packet together with the session it arrived on.
pub struct Inbound {
    pub(crate) ctx: Context,
    pub(crate) packet: Packet,
}

impl Inbound {
    pub fn new(ctx: Context, packet: Packet) -> Self {
        Self { ctx, packet }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// A handler parameter.
pub trait FromInbound: Sized + Send + 'static {
    const KIND: ArgKind;

    fn from_inbound(inbound: &Inbound) -> Result<Self, DispatchError>;
}

impl FromInbound for Context {
    const KIND: ArgKind = ArgKind::Context;

    fn from_inbound(inbound: &Inbound) -> Result<Self, DispatchError> {
        Ok(inbound.ctx.clone())
    }
}

impl FromInbound for Packet {
    const KIND: ArgKind = ArgKind::Packet;

    fn from_inbound(inbound: &Inbound) -> Result<Self, DispatchError> {
        Ok(inbound.packet.clone())
    }
}

/// The raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(pub Bytes);

impl FromInbound for Payload {
    const KIND: ArgKind = ArgKind::Payload;

    fn from_inbound(inbound: &Inbound) -> Result<Self, DispatchError> {
        Ok(Payload(inbound.packet.payload.clone()))
    }
}

/// A typed message: decoded from the payload as a parameter, encoded as a reply
/// when returned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Msg<T>(pub T);

impl<T: DeserializeOwned + Send + 'static> FromInbound for Msg<T> {
    const KIND: ArgKind = ArgKind::Message;

    fn from_inbound(inbound: &Inbound) -> Result<Self, DispatchError> {
        inbound
            .ctx
            .serializer()
            .unmarshal(&inbound.packet.payload)
            .map(Msg)
            .map_err(DispatchError::BadPayload)
    }
}

/// A handler output.
pub trait IntoOutcome: Send + 'static {
    const SHAPE: OutputShape;

    fn into_outcome(self, serializer: Serializer) -> Result<Outcome, DispatchError>;
}

impl IntoOutcome for () {
    const SHAPE: OutputShape = OutputShape::Nothing;

    fn into_outcome(self, _: Serializer) -> Result<Outcome, DispatchError> {
        Ok(Outcome::Ack)
    }
}

impl<T: Serialize + Send + 'static> IntoOutcome for Msg<T> {
    const SHAPE: OutputShape = OutputShape::Message;

    fn into_outcome(self, serializer: Serializer) -> Result<Outcome, DispatchError> {
        serializer
            .marshal(&self.0)
            .map(Outcome::Message)
            .map_err(DispatchError::Encode)
    }
}

impl<E: Into<ReplyError> + Send + 'static> IntoOutcome for Result<(), E> {
    const SHAPE: OutputShape = OutputShape::Error;

    fn into_outcome(self, _: Serializer) -> Result<Outcome, DispatchError> {
        self.map(|()| Outcome::Ack)
            .map_err(|e| DispatchError::Handler(e.into()))
    }
}

impl<T, E> IntoOutcome for Result<Msg<T>, E>
where
    T: Serialize + Send + 'static,
    E: Into<ReplyError> + Send + 'static,
{
    const SHAPE: OutputShape = OutputShape::MessageOrError;

    fn into_outcome(self, serializer: Serializer) -> Result<Outcome, DispatchError> {
        // a returned error wins; the message is never encoded
        match self {
            Ok(msg) => msg.into_outcome(serializer),
            Err(e) => Err(DispatchError::Handler(e.into())),
        }
    }
}

/// An async function usable as a route. `Args` is the tuple of its parameters.
pub trait Handler<Args>: Clone + Send + Sync + 'static {
    fn signature() -> Signature;

    fn call(self, inbound: Inbound) -> BoxFuture<Result<Outcome, DispatchError>>;
}

macro_rules! impl_handler {
    ( $( $arg:ident ),* ) => {
        #[allow(non_snake_case, unused_variables)]
        impl<F, Fut, Out, $( $arg, )*> Handler<( $( $arg, )* )> for F
        where
            F: Fn( $( $arg ),* ) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Out> + Send + 'static,
            Out: IntoOutcome,
            $( $arg: FromInbound, )*
        {
            fn signature() -> Signature {
                Signature {
                    inputs: vec![ $( <$arg as FromInbound>::KIND ),* ],
                    output: <Out as IntoOutcome>::SHAPE,
                }
            }

            fn call(self, inbound: Inbound) -> BoxFuture<Result<Outcome, DispatchError>> {
                Box::pin(async move {
                    $( let $arg = <$arg as FromInbound>::from_inbound(&inbound)?; )*
                    let serializer = inbound.ctx.serializer();
                    drop(inbound);
                    (self)( $( $arg ),* ).await.into_outcome(serializer)
                })
            }
        }
    };
}

impl_handler!();
impl_handler!(A);
impl_handler!(A, B);
impl_handler!(A, B, C);
impl_handler!(A, B, C, D);
