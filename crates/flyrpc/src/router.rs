//! # Router
//!
//! Maps command codes to handlers and turns one inbound request into at most one
//! reply packet.
//!
//! ## Invariants
//! - **Validated Registration**: a route is checked once, when it is added. A
//!   malformed code or a repeated parameter kind never reaches dispatch.
//! - **Contained Panics**: a panicking handler becomes a `HANDLER_PANIC` reply.
//!   The session, the pump and other handlers keep running. The logged backtrace
//!   is captured at the panic site.
//! - **One Reply**: a call gets exactly one response (message, ack, or error code);
//!   a fire-and-forget message gets none. When both an error and a message are
//!   produced, the error wins.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Once;

use bytes::Bytes;
use dashmap::DashMap;
use flywire::MAX_CODE_LEN;
use flywire::Packet;
use futures::FutureExt;

use crate::context::Context;
use crate::handler::ArgKind;
use crate::handler::BoxFuture;
use crate::handler::DispatchError;
use crate::handler::Handler;
use crate::handler::Inbound;
use crate::handler::Outcome;
use crate::handler::Signature;

/// Longest backtrace kept in a panic log line.
const MAX_BACKTRACE_LEN: usize = 8192;

thread_local! {
    /// Set while a handler is being built or polled on this thread.
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
    /// Backtrace of the last handler panic on this thread, taken at the panic site.
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a panic hook that records a backtrace for handler panics. Panics
/// outside handlers reach the previous hook unchanged.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_HANDLER.get() {
                PANIC_TRACE.set(Some(Backtrace::force_capture().to_string()));
            } else {
                previous(info);
            }
        }));
    });
}

fn in_handler<R>(f: impl FnOnce() -> R) -> R {
    let outer = IN_HANDLER.replace(true);
    let out = f();
    IN_HANDLER.set(outer);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    EmptyCode,
    CodeTooLong(usize),
    /// The code already has a handler. Use `Router::replace_route` to swap it.
    Duplicate(String),
    /// The handler takes two parameters of the same kind.
    RepeatedArgument { code: String, kind: ArgKind },
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCode => write!(f, "command code is empty"),
            Self::CodeTooLong(len) => {
                write!(f, "command code is {} bytes, limit is {}", len, MAX_CODE_LEN)
            }
            Self::Duplicate(code) => write!(f, "command '{}' is already registered", code),
            Self::RepeatedArgument { code, kind } => {
                write!(f, "handler for '{}' takes more than one {:?} parameter", code, kind)
            }
        }
    }
}

impl std::error::Error for RouteError {}

type ErasedHandler =
    Box<dyn Fn(Inbound) -> BoxFuture<Result<Outcome, DispatchError>> + Send + Sync>;

/// A validated, type-erased handler.
pub struct Route {
    code: String,
    signature: Signature,
    handler: ErasedHandler,
}

impl Route {
    pub fn new<H, Args>(code: impl Into<String>, handler: H) -> Result<Self, RouteError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let code = code.into();
        let signature = H::signature();
        validate(&code, &signature)?;

        Ok(Self {
            code,
            signature,
            handler: Box::new(move |inbound| handler.clone().call(inbound)),
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Runs the handler with panics caught, both while building and while
    /// polling its future.
    pub async fn invoke(&self, inbound: Inbound) -> Result<Outcome, DispatchError> {
        install_panic_hook();

        let build = AssertUnwindSafe(|| (self.handler)(inbound));
        let future = match in_handler(|| std::panic::catch_unwind(build)) {
            Ok(future) => future,
            Err(panic) => return Err(self.panicked(panic)),
        };

        let mut future = AssertUnwindSafe(future).catch_unwind();
        match std::future::poll_fn(|cx| in_handler(|| future.poll_unpin(cx))).await {
            Ok(result) => result,
            Err(panic) => Err(self.panicked(panic)),
        }
    }

    fn panicked(&self, panic: Box<dyn Any + Send>) -> DispatchError {
        let message = panic_message(panic.as_ref());
        let mut backtrace = PANIC_TRACE
            .take()
            .unwrap_or_else(|| Backtrace::force_capture().to_string());
        truncate(&mut backtrace, MAX_BACKTRACE_LEN);

        let code = &self.code;
        tracing::error!(code = %code, panic = %message, backtrace = %backtrace, "handler panicked");
        DispatchError::Panic { message, backtrace }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("code", &self.code)
            .field("signature", &self.signature)
            .finish()
    }
}

fn validate(code: &str, signature: &Signature) -> Result<(), RouteError> {
    if code.is_empty() {
        return Err(RouteError::EmptyCode);
    }
    if code.len() > MAX_CODE_LEN {
        return Err(RouteError::CodeTooLong(code.len()));
    }

    for (i, kind) in signature.inputs.iter().enumerate() {
        if signature.inputs[..i].contains(kind) {
            return Err(RouteError::RepeatedArgument { code: code.to_string(), kind: *kind });
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn truncate(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Command table shared by every session that dispatches through it.
#[derive(Default)]
pub struct Router {
    routes: DashMap<String, Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Fails if the code is taken or the handler is malformed.
    pub fn add_route<H, Args>(&self, code: impl Into<String>, handler: H) -> Result<(), RouteError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let route = Route::new(code, handler)?;
        match self.routes.entry(route.code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RouteError::Duplicate(route.code)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!(code = %route.code, signature = ?route.signature, "route added");
                slot.insert(Arc::new(route));
                Ok(())
            }
        }
    }

    /// Registers a handler, overwriting whatever served the code before.
    pub fn replace_route<H, Args>(
        &self,
        code: impl Into<String>,
        handler: H,
    ) -> Result<(), RouteError>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let route = Route::new(code, handler)?;
        tracing::debug!(code = %route.code, "route replaced");
        self.routes.insert(route.code.clone(), Arc::new(route));
        Ok(())
    }

    pub fn remove_route(&self, code: &str) -> bool {
        self.routes.remove(code).is_some()
    }

    pub fn route(&self, code: &str) -> Option<Arc<Route>> {
        self.routes.get(code).map(|r| r.value().clone())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.routes.contains_key(code)
    }

    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Runs the handler for `packet` and builds the reply, if one is owed.
    ///
    /// Requests always get `Some`: the handler's message, an empty ack, or an
    /// error-flagged response carrying the error code. Messages always get `None`.
    pub async fn dispatch(&self, ctx: &Context, packet: Packet) -> Option<Packet> {
        let expects_reply = packet.expects_reply();
        let seq = packet.seq;
        let code = packet.code.clone();
        let client_id = packet.client_id;

        // the map guard must not live across the handler's await
        let route = self.route(&code);
        let result = match route {
            Some(route) => route.invoke(Inbound::new(ctx.clone(), packet)).await,
            None => Err(DispatchError::NotFound),
        };

        let reply = match result {
            Ok(_) if !expects_reply => None,
            Ok(Outcome::Ack) => Some(Packet::response(seq, code, Bytes::new())),
            Ok(Outcome::Message(payload)) => Some(Packet::response(seq, code, payload)),
            Err(e) if expects_reply => {
                tracing::debug!(code = %code, seq, error = %e, "call failed");
                Some(Packet::error(seq, code, e.code()))
            }
            Err(e) => {
                tracing::warn!(code = %code, error = %e, "message handler failed");
                None
            }
        };
        reply.map(|p| p.with_client_id(client_id))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("codes", &self.codes()).finish()
    }
}
