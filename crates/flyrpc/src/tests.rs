//! Tests for the router and the correlation engine with mock transports.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use flywire::Packet;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::context::Context;
use crate::error::Error;
use crate::error::ReplyError;
use crate::error::Result;
use crate::error::codes;
use crate::handler::ArgKind;
use crate::handler::DispatchError;
use crate::handler::Inbound;
use crate::handler::Msg;
use crate::handler::OutputShape;
use crate::handler::Payload;
use crate::router::Route;
use crate::router::RouteError;
use crate::router::Router;
use crate::transport;
use crate::transport::Transport;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct User {
    id: i32,
    name: String,
}

fn user() -> User {
    User { id: 123, name: "abc".into() }
}

/// Mock transport that records what is sent and never receives anything.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Packet>>,
}

impl Recorder {
    async fn wait_for(&self, n: usize) -> Vec<Packet> {
        for _ in 0..1000 {
            {
                let sent = self.sent.lock().unwrap();
                if sent.len() >= n {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("Expected {} sent packets", n);
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Transport for Recorder {
    async fn send(&self, packet: &Packet) -> transport::Result<()> {
        self.sent.lock().unwrap().push(packet.clone());
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Packet>> {
        std::future::pending().await
    }

    async fn close(&self) -> transport::Result<()> {
        Ok(())
    }
}

/// Mock transport whose sends succeed `ok_sends` times and then fail.
struct FailingWriter {
    ok_sends: AtomicUsize,
    sent: AtomicUsize,
    error: transport::Error,
}

impl FailingWriter {
    fn after(ok_sends: usize, error: transport::Error) -> Self {
        Self { ok_sends: AtomicUsize::new(ok_sends), sent: AtomicUsize::new(0), error }
    }
}

#[async_trait::async_trait]
impl Transport for FailingWriter {
    async fn send(&self, _packet: &Packet) -> transport::Result<()> {
        let budget = &self.ok_sends;
        match budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => Err(self.error.clone()),
        }
    }

    async fn recv(&self) -> transport::Result<Option<Packet>> {
        std::future::pending().await
    }

    async fn close(&self) -> transport::Result<()> {
        Ok(())
    }
}

#[inline(never)]
fn explode_in_handler(n: i32) -> i32 {
    if n < 0 {
        panic!("kaboom");
    }
    n
}

fn router() -> Arc<Router> {
    let router = Router::new();
    router.add_route("echo", |Msg(u): Msg<User>| async move { Msg(u) }).unwrap();
    router.add_route("fail", || async { Err::<(), _>(ReplyError::new("FOO")) }).unwrap();
    router.add_route("note", |Payload(_): Payload| async {}).unwrap();
    router
        .add_route("divide", |Msg(n): Msg<i32>| async move {
            if n == 0 {
                panic!("division by zero");
            }
            Msg(100 / n)
        })
        .unwrap();
    router
        .add_route("lookup", |Msg(id): Msg<i32>| async move {
            if id == 123 { Ok(Msg(user())) } else { Err(ReplyError::new("NO_USER")) }
        })
        .unwrap();
    Arc::new(router)
}

fn detached(router: Arc<Router>) -> (Arc<Recorder>, Context) {
    let recorder = Arc::new(Recorder::default());
    let ctx = Context::without_pump(recorder.clone(), router, Config::default());
    (recorder, ctx)
}

fn json<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

async fn reply_to(ctx: &Context, packet: Packet) -> Packet {
    ctx.router().dispatch(ctx, packet).await.expect("reply")
}

/// Starts a call in the background that nobody answers unless the test does.
fn spawn_call(ctx: &Context, code: &'static str, timeout: Duration) -> JoinHandle<Result<Bytes>> {
    let caller = ctx.clone();
    tokio::spawn(async move { caller.call_raw(code, Bytes::new(), timeout).await })
}

// ============================================================================
//  1. REGISTRATION
// ============================================================================

#[test]
fn test_duplicate_route_is_rejected() {
    let router = Router::new();
    router.add_route("echo", || async {}).unwrap();

    match router.add_route("echo", || async {}) {
        Err(RouteError::Duplicate(code)) => assert_eq!(code, "echo"),
        other => panic!("Expected Duplicate, got {:?}", other),
    }
    router.replace_route("echo", |Payload(p): Payload| async move { Msg(p.len()) }).unwrap();
    assert_eq!(router.len(), 1);
}

#[test]
fn test_repeated_argument_kind_is_rejected() {
    let router = Router::new();
    let result = router.add_route("twice", |Msg(_a): Msg<i32>, Msg(_b): Msg<i32>| async {});
    assert!(matches!(
        result,
        Err(RouteError::RepeatedArgument { kind: ArgKind::Message, .. })
    ));

    let result = router.add_route("ctx2", |_a: Context, _b: Context| async {});
    assert!(matches!(
        result,
        Err(RouteError::RepeatedArgument { kind: ArgKind::Context, .. })
    ));
    assert!(router.is_empty());
}

#[test]
fn test_bad_codes_are_rejected() {
    let router = Router::new();
    assert!(matches!(router.add_route("", || async {}), Err(RouteError::EmptyCode)));
    assert!(matches!(
        router.add_route("x".repeat(256), || async {}),
        Err(RouteError::CodeTooLong(256))
    ));
    router.add_route("x".repeat(255), || async {}).unwrap();
}

#[test]
fn test_signature_is_recorded() {
    let router = Router::new();
    router
        .add_route(
            "full",
            |_ctx: Context, _p: Packet, Payload(_b): Payload, Msg(u): Msg<User>| async move {
                Ok::<_, ReplyError>(Msg(u))
            },
        )
        .unwrap();

    let route = router.route("full").unwrap();
    assert_eq!(
        route.signature().inputs,
        vec![ArgKind::Context, ArgKind::Packet, ArgKind::Payload, ArgKind::Message]
    );
    assert_eq!(route.signature().output, OutputShape::MessageOrError);
    assert!(route.signature().output.has_error());
}

// ============================================================================
//  2. DISPATCH
// ============================================================================

#[tokio::test]
async fn test_dispatch_echo() {
    let (_, ctx) = detached(router());
    let reply = ctx
        .router()
        .dispatch(&ctx, Packet::request(7, "echo", json(&user())))
        .await
        .expect("reply");

    assert!(reply.flag.is_response());
    assert!(!reply.flag.is_error());
    assert_eq!(reply.seq, 7);
    assert_eq!(reply.code, "echo");
    assert_eq!(reply.payload, json(&user()));
}

#[tokio::test]
async fn test_dispatch_handler_error() {
    let (_, ctx) = detached(router());
    let reply = reply_to(&ctx, Packet::request(1, "fail", Bytes::new())).await;
    assert!(reply.flag.is_error());
    assert_eq!(reply.payload, Bytes::from_static(b"FOO"));
}

#[tokio::test]
async fn test_dispatch_error_wins_over_message() {
    let (_, ctx) = detached(router());
    let ok = ctx.router().dispatch(&ctx, Packet::request(1, "lookup", json(&123))).await.unwrap();
    assert_eq!(ok.payload, json(&user()));

    let err = ctx.router().dispatch(&ctx, Packet::request(2, "lookup", json(&9))).await.unwrap();
    assert!(err.flag.is_error());
    assert_eq!(err.payload, Bytes::from_static(b"NO_USER"));
}

#[tokio::test]
async fn test_dispatch_missing_route() {
    let (_, ctx) = detached(router());
    let reply = reply_to(&ctx, Packet::request(3, "nope", Bytes::new())).await;
    assert!(reply.flag.is_error());
    assert_eq!(reply.payload, Bytes::from(codes::NOT_FOUND));
}

#[tokio::test]
async fn test_dispatch_ack_for_unit_output() {
    let (_, ctx) = detached(router());
    let reply = reply_to(&ctx, Packet::request(4, "note", Bytes::from_static(b"x"))).await;
    assert!(reply.flag.is_response());
    assert!(!reply.flag.is_error());
    assert!(reply.payload.is_empty());
}

#[tokio::test]
async fn test_dispatch_bad_payload() {
    let (_, ctx) = detached(router());
    let reply = reply_to(&ctx, Packet::request(5, "echo", Bytes::from_static(b"{"))).await;
    assert!(reply.flag.is_error());
    assert_eq!(reply.payload, Bytes::from(codes::BAD_PAYLOAD));
}

#[tokio::test]
async fn test_messages_never_get_replies() {
    let (_, ctx) = detached(router());
    let router = ctx.router().clone();
    assert!(router.dispatch(&ctx, Packet::message(1, "echo", json(&user()))).await.is_none());
    assert!(router.dispatch(&ctx, Packet::message(2, "fail", Bytes::new())).await.is_none());
    assert!(router.dispatch(&ctx, Packet::message(3, "nope", Bytes::new())).await.is_none());
}

#[tokio::test]
async fn test_panic_is_contained() {
    let (_, ctx) = detached(router());
    let router = ctx.router().clone();

    let reply = router.dispatch(&ctx, Packet::request(1, "divide", json(&0))).await.unwrap();
    assert!(reply.flag.is_error());
    assert_eq!(reply.payload, Bytes::from(codes::HANDLER_PANIC));

    let reply = router.dispatch(&ctx, Packet::request(2, "divide", json(&4))).await.unwrap();
    assert_eq!(reply.payload, json(&25));
}

#[tokio::test]
async fn test_panic_backtrace_starts_at_the_panic() {
    let (_, ctx) = detached(router());
    let route = Route::new("kaboom", |Msg(n): Msg<i32>| async move {
        Msg(explode_in_handler(n))
    })
    .unwrap();

    let inbound = Inbound::new(ctx, Packet::request(1, "kaboom", json(&-1)));
    match route.invoke(inbound).await {
        Err(DispatchError::Panic { message, backtrace }) => {
            assert_eq!(message, "kaboom");
            assert!(backtrace.contains("explode_in_handler"), "backtrace: {}", backtrace);
        }
        other => panic!("Expected Panic, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_reply_carries_client_id() {
    let (_, ctx) = detached(router());
    let request = Packet::request(9, "echo", json(&user())).with_client_id(Some(77));
    let reply = ctx.router().dispatch(&ctx, request).await.unwrap();
    assert_eq!(reply.client_id, Some(77));
}

// ============================================================================
//  3. CORRELATION
// ============================================================================

#[tokio::test]
async fn test_reply_completes_call() {
    let (recorder, ctx) = detached(router());

    let caller = ctx.clone();
    let call = tokio::spawn(async move { caller.call::<_, User>("echo", &user()).await });

    let request = recorder.wait_for(1).await.remove(0);
    assert!(request.flag.is_request());
    assert_eq!(ctx.pending_calls(), 1);

    ctx.emit_packet(Packet::response(request.seq, "echo", request.payload.clone()));
    assert_eq!(call.await.unwrap().unwrap(), user());
    assert_eq!(ctx.pending_calls(), 0);
}

async fn rejected_call(ctx: &Context, recorder: &Recorder, nth: usize, error_code: &str) -> Error {
    let call = spawn_call(ctx, "x", Duration::from_secs(5));

    let request = recorder.wait_for(nth + 1).await.remove(nth);
    ctx.emit_packet(Packet::error(request.seq, "x", error_code));
    call.await.unwrap().unwrap_err()
}

#[tokio::test]
async fn test_remote_error_codes_map_to_variants() {
    let (recorder, ctx) = detached(router());

    match rejected_call(&ctx, &recorder, 0, codes::NOT_FOUND).await {
        Error::NotFound(code) => assert_eq!(code, "x"),
        other => panic!("Expected NotFound, got {:?}", other),
    }
    assert!(matches!(
        rejected_call(&ctx, &recorder, 1, codes::HANDLER_PANIC).await,
        Error::HandlerPanic(_)
    ));
    match rejected_call(&ctx, &recorder, 2, "FOO").await {
        Error::Remote(e) => assert_eq!(e.code(), "FOO"),
        other => panic!("Expected Remote, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_and_late_reply_is_dropped() {
    let (recorder, ctx) = detached(router());

    let err = ctx.call_raw("slow", Bytes::new(), Duration::from_millis(10)).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(ctx.pending_calls(), 0);

    let request = recorder.wait_for(1).await.remove(0);
    ctx.emit_packet(Packet::response(request.seq, "slow", Bytes::from_static(b"late")));
    assert_eq!(ctx.pending_calls(), 0);
}

#[tokio::test]
async fn test_send_message_registers_nothing() {
    let (recorder, ctx) = detached(router());
    ctx.send_message("note", &user()).await.unwrap();
    ctx.send_message("note", &user()).await.unwrap();

    let sent = recorder.wait_for(2).await;
    assert!(sent.iter().all(|p| !p.expects_reply()));
    assert_ne!(sent[0].seq, sent[1].seq);
    assert_eq!(ctx.pending_calls(), 0);
}

#[tokio::test]
async fn test_abandoned_calls_free_their_slots() {
    let recorder = Arc::new(Recorder::default());
    let config = Config::default().with_max_pending(4);
    let ctx = Context::without_pump(recorder.clone(), router(), config);

    for _ in 0..4 {
        let call = ctx.call_raw("x", Bytes::new(), Duration::from_secs(30));
        assert!(tokio::time::timeout(Duration::from_millis(10), call).await.is_err());
    }
    assert_eq!(ctx.pending_calls(), 0);

    let call = spawn_call(&ctx, "x", Duration::from_secs(30));
    recorder.wait_for(5).await;
    assert_eq!(ctx.pending_calls(), 1);

    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());
    assert_eq!(ctx.pending_calls(), 0);
}

#[tokio::test]
async fn test_too_many_pending() {
    let recorder = Arc::new(Recorder::default());
    let config = Config::default().with_max_pending(1);
    let ctx = Context::without_pump(recorder.clone(), router(), config);

    let first = spawn_call(&ctx, "a", Duration::from_secs(5));
    recorder.wait_for(1).await;

    let err = ctx.call_raw("b", Bytes::new(), Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::TooManyPending));

    ctx.close().await.unwrap();
    assert!(first.await.unwrap().unwrap_err().is_closed());
}

#[tokio::test]
async fn test_code_too_long_fails_before_send() {
    let (recorder, ctx) = detached(router());
    let code = "c".repeat(256);
    let err = ctx.call_raw(&code, Bytes::new(), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(flywire::Error::CodeTooLong(256))));
    assert_eq!(recorder.count(), 0);
    assert_eq!(ctx.pending_calls(), 0);
}

// ============================================================================
//  4. PING
// ============================================================================

#[tokio::test]
async fn test_ping_is_echoed_as_pong() {
    let (recorder, ctx) = detached(router());
    ctx.emit_packet(Packet::ping(5, Bytes::from_static(b"abc")));

    let pong = recorder.wait_for(1).await.remove(0);
    assert!(pong.flag.is_pong());
    assert_eq!(pong.seq, 5);
    assert_eq!(pong.payload, Bytes::from_static(b"abc"));
}

#[tokio::test]
async fn test_pong_completes_ping() {
    let (recorder, ctx) = detached(router());

    let pinger = ctx.clone();
    let ping = tokio::spawn(async move { pinger.ping(16, Duration::from_secs(5)).await });

    let sent = recorder.wait_for(1).await.remove(0);
    assert!(sent.flag.is_ping());
    assert_eq!(sent.payload.len(), 16);

    ctx.emit_packet(Packet::pong(sent.seq, sent.payload.clone()));
    ping.await.unwrap().unwrap();
    assert_eq!(ctx.pending_pings(), 0);
}

#[tokio::test]
async fn test_ping_default_uses_session_timeout() {
    let recorder = Arc::new(Recorder::default());
    let config = Config::default().with_ping_timeout(Duration::from_millis(20));
    let ctx = Context::without_pump(recorder.clone(), router(), config);

    let started = std::time::Instant::now();
    let err = ctx.ping_default(0).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(recorder.count(), 1);
    assert_eq!(ctx.pending_pings(), 0);
}

// ============================================================================
//  5. LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_close_fails_pending_and_runs_callbacks_once() {
    let (recorder, ctx) = detached(router());
    let closes = Arc::new(AtomicUsize::new(0));

    let counter = closes.clone();
    ctx.on_close(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let call = spawn_call(&ctx, "x", Duration::from_secs(30));
    recorder.wait_for(1).await;

    ctx.close().await.unwrap();
    ctx.close().await.unwrap();

    assert!(call.await.unwrap().unwrap_err().is_closed());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(ctx.is_closed());

    let counter = closes.clone();
    ctx.on_close(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(closes.load(Ordering::SeqCst), 2);

    assert!(ctx.send_message("note", &1).await.unwrap_err().is_closed());
    assert!(ctx.ping(0, Duration::from_secs(1)).await.unwrap_err().is_closed());
}

#[tokio::test]
async fn test_session_values() {
    #[derive(Clone, Debug, PartialEq)]
    struct Login(String);

    let (_, ctx) = detached(router());
    assert!(ctx.get::<Login>().is_none());

    ctx.insert(Login("ada".into()));
    ctx.insert(5u32);
    assert_eq!(ctx.get::<Login>(), Some(Login("ada".into())));

    ctx.with_value::<u32, _>(|n| *n.unwrap() += 1);
    assert_eq!(ctx.get::<u32>(), Some(6));

    assert_eq!(ctx.remove::<Login>(), Some(Login("ada".into())));
    assert!(ctx.get::<Login>().is_none());
}

#[tokio::test]
async fn test_write_failure_closes_session() {
    let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
    let transport = Arc::new(FailingWriter::after(1, broken.into()));
    let ctx = Context::without_pump(transport.clone(), router(), Config::default());

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    ctx.on_close(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let first = spawn_call(&ctx, "a", Duration::from_secs(30));
    while transport.sent.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let err = ctx.send_raw("b", Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)), "got {:?}", err);
    assert!(ctx.is_closed());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(first.await.unwrap().unwrap_err().is_closed());
}

#[tokio::test]
async fn test_rejected_packet_keeps_session_open() {
    let too_big = flywire::Error::PayloadTooLarge { len: 10, max: 1 };
    let transport = Arc::new(FailingWriter::after(0, too_big.into()));
    let ctx = Context::without_pump(transport, router(), Config::default());

    let err = ctx.send_raw("b", Bytes::from_static(b"0123456789")).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(flywire::Error::PayloadTooLarge { .. })));
    assert!(!ctx.is_closed());
}
