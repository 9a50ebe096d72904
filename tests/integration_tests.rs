//! End-to-end integration tests: a real event loop on a background thread,
//! driven over TCP and Unix sockets by the blocking clients, raw sockets and
//! tokio-tungstenite.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use jrpc_collections::Buffer;
use jrpc_protocol::websocket::{FrameHeader, OpCode, encode_client_frame};
use jrpc_server::RpcServer;
use jrpc_transport::{
    CancellationToken, ClientError, ConnectionId, Hooks, Listener, NoHooks, Notifier,
    NotifyClient, NotifyHandle, PeerAddr, ProtocolMode, RpcClient, Session, TransportConfig,
    TransportError, TransportServer,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const WAIT: Duration = Duration::from_secs(5);

/// A transport server running on its own thread. Dropping it cancels the
/// loop and joins the thread.
struct TestServer {
    addr: Option<SocketAddr>,
    notify: NotifyHandle,
    /// Params of every `record` call, in arrival order.
    log: Arc<Mutex<Vec<Value>>>,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn addr(&self) -> SocketAddr {
        self.addr.expect("server has no TCP listener")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn tcp_config(mode: ProtocolMode) -> TransportConfig {
    TransportConfig {
        listeners: vec![Listener::tcp("127.0.0.1", 0)],
        mode,
        ..TransportConfig::default()
    }
}

fn test_router(log: Arc<Mutex<Vec<Value>>>) -> RpcServer {
    #[derive(Default)]
    struct Counter {
        value: i64,
    }

    let mut router = RpcServer::new();
    router.register_function("hello", |params: &Value| {
        Ok(params.get(0).cloned().unwrap_or(Value::Null))
    });
    router.register_function("echo", |params: &Value| Ok(params.clone()));
    router.register_function("big", |params: &Value| {
        let len = params.get(0).and_then(Value::as_u64).unwrap_or(0) as usize;
        Ok(Value::String("x".repeat(len)))
    });
    router.register_function("record", move |params: &Value| {
        log.lock().push(params.clone());
        Ok(Value::Null)
    });
    router.register_class_object("Counter", Counter::default());
    router
        .register_member_function("Counter.incr", |counter: &mut Counter, _: &Value| {
            counter.value += 1;
            Ok(json!(counter.value))
        })
        .unwrap();
    router
}

fn start_server(config: TransportConfig) -> TestServer {
    start_server_with_hooks(config, Box::new(NoHooks))
}

fn start_server_with_hooks(config: TransportConfig, mut hooks: Box<dyn Hooks + Send>) -> TestServer {
    let mut server = TransportServer::bind(config).unwrap();
    server.register_notify_services(["news", "weather"]).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut router = test_router(log.clone());
    let addr = server.local_addr();
    let notify = server.notify_handle();
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let thread = std::thread::spawn(move || {
        server.serve(&mut router, hooks.as_mut(), &loop_cancel).unwrap();
    });

    TestServer {
        addr,
        notify,
        log,
        cancel,
        thread: Some(thread),
    }
}

/// Poll `check` until it holds or the wait runs out.
fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn raw_connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

/// Read until the peer closes or resets; true if it did within the wait.
fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) => return true,
            Err(_) => return false,
        }
    }
}

/// Read one NUL-terminated message, scanning only newly read bytes.
fn read_until_nul(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Vec<u8> {
    let mut scanned = 0;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        if let Some(pos) = buf[scanned..].iter().position(|&b| b == 0) {
            let end = scanned + pos + 1;
            let message = buf[..end - 1].to_vec();
            buf.drain(..end);
            return message;
        }
        scanned = buf.len();
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before the message was complete");
        buf.extend_from_slice(&chunk[..n]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw WebSocket helpers
// ─────────────────────────────────────────────────────────────────────────────

fn ws_connect(addr: SocketAddr, path: &str, subprotocol: &str) -> TcpStream {
    let mut stream = raw_connect(addr);
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {subprotocol}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).unwrap();

    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).unwrap(), 1, "upgrade refused");
        reply.push(byte[0]);
    }
    let reply = String::from_utf8(reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 101"), "unexpected reply: {reply}");
    assert!(reply.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

fn ws_send(stream: &mut TcpStream, fin: bool, opcode: OpCode, payload: &[u8]) {
    let mask: [u8; 4] = rand::random();
    stream.write_all(&encode_client_frame(fin, opcode, payload, mask)).unwrap();
}

/// Send `payload` as a text message split into random fragments.
fn ws_send_fragmented(stream: &mut TcpStream, payload: &[u8]) {
    let mut rng = rand::rng();
    let pieces = rng.random_range(1..=payload.len().min(8));
    let mut cuts: Vec<usize> = (0..pieces - 1).map(|_| rng.random_range(1..payload.len())).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut frames = Vec::new();
    let mut start = 0;
    for &cut in &cuts {
        frames.push(&payload[start..cut]);
        start = cut;
    }
    frames.push(&payload[start..]);

    let last = frames.len() - 1;
    for (i, fragment) in frames.into_iter().enumerate() {
        let opcode = if i == 0 { OpCode::Text } else { OpCode::Continuation };
        ws_send(stream, i == last, opcode, fragment);
    }
}

fn ws_read_frame(stream: &mut TcpStream) -> (OpCode, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(header) = FrameHeader::parse(&buf) {
            assert!(!header.is_masked(), "server frames are never masked");
            let end = header.frame_len().unwrap();
            if buf.len() >= end {
                return (header.opcode, buf[header.header_len..end].to_vec());
            }
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before a frame arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn ws_close_code(stream: &mut TcpStream) -> u16 {
    let (opcode, payload) = ws_read_frame(stream);
    assert_eq!(opcode, OpCode::Close);
    u16::from_be_bytes([payload[0], payload[1]])
}

// ─────────────────────────────────────────────────────────────────────────────
// Plain JSON
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rpc_handshake_and_hello() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut client = RpcClient::connect(server.addr()).unwrap();
    assert_eq!(client.call("hello", Some(json!(["world"]))).unwrap(), json!("world"));
    assert_eq!(client.call("echo", Some(json!({"a": [1, 2]}))).unwrap(), json!({"a": [1, 2]}));
}

#[test]
fn raw_handshake_reply_is_literal() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut stream = raw_connect(server.addr());
    stream.write_all(b"{\"protocol\":\"rpc\"}\0").unwrap();

    let mut reply = [0u8; 14];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"handshake OK\r\n");

    stream.write_all(b"{\"method\":\"hello\",\"params\":[\"raw\"]}\0").unwrap();
    let mut buf = Vec::new();
    let response: Value = serde_json::from_slice(&read_until_nul(&mut stream, &mut buf)).unwrap();
    assert_eq!(response, json!({"jsonrpc": "2.0", "result": "raw"}));
}

#[test]
fn bogus_handshake_closes_without_reply() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut stream = raw_connect(server.addr());
    stream.write_all(b"{\"protocol\":\"bogus\"}\0").unwrap();

    let mut buf = Vec::new();
    let read = stream.read_to_end(&mut buf);
    assert!(buf.is_empty(), "refused handshake must not be answered");
    assert!(matches!(read, Ok(0)) || matches!(read, Err(ref e) if e.kind() == ErrorKind::ConnectionReset));
}

#[test]
fn unknown_method_keeps_connection_open() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut client = RpcClient::connect(server.addr()).unwrap();

    match client.call("missing", None) {
        Err(ClientError::Remote(message)) => assert_eq!(message, "method missing is unknown"),
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert_eq!(client.call("hello", Some(json!([1]))).unwrap(), json!(1));
}

#[test]
fn member_functions_keep_class_state() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut first = RpcClient::connect(server.addr()).unwrap();
    let mut second = RpcClient::connect(server.addr()).unwrap();

    assert_eq!(first.call("Counter.incr", None).unwrap(), json!(1));
    assert_eq!(second.call("Counter.incr", None).unwrap(), json!(2));
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut stream = raw_connect(server.addr());
    stream.write_all(b"{\"protocol\":\"rpc\"}\0").unwrap();
    let mut ack = [0u8; 14];
    stream.read_exact(&mut ack).unwrap();

    // small responses drain immediately, so nothing is dropped
    for i in 0..3 {
        let request = format!("{{\"method\":\"hello\",\"params\":[{i}]}}\0");
        stream.write_all(request.as_bytes()).unwrap();
    }
    let mut buf = Vec::new();
    for i in 0..3 {
        let response: Value = serde_json::from_slice(&read_until_nul(&mut stream, &mut buf)).unwrap();
        assert_eq!(response["result"], json!(i));
    }
}

#[test]
fn backpressure_drops_requests_while_a_response_is_pending() {
    const LEN: usize = 32 * 1024 * 1024;

    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut stream = raw_connect(server.addr());
    stream.write_all(b"{\"protocol\":\"rpc\"}\0").unwrap();
    let mut ack = [0u8; 14];
    stream.read_exact(&mut ack).unwrap();

    let requests = format!(
        "{{\"method\":\"big\",\"params\":[{LEN}]}}\0{{\"method\":\"hello\",\"params\":[\"late\"]}}\0"
    );
    stream.write_all(requests.as_bytes()).unwrap();

    let mut buf = Vec::new();
    let response: Value = serde_json::from_slice(&read_until_nul(&mut stream, &mut buf)).unwrap();
    let result = response["result"].as_str().unwrap();
    assert_eq!(result.len(), LEN);
    assert!(result.bytes().all(|b| b == b'x'));

    // the second request arrived while the first response was still queued
    stream.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let mut extra = [0u8; 64];
    match stream.read(&mut extra) {
        Ok(n) => panic!("unexpected {n} bytes after the dropped request"),
        Err(e) => assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
    }
    assert!(buf.is_empty());
}

#[test]
fn oversized_json_request_is_dropped_including_its_late_tail() {
    let config = TransportConfig {
        max_request_len: 1024,
        ..tcp_config(ProtocolMode::Json)
    };
    let server = start_server(config);
    let mut stream = raw_connect(server.addr());
    stream.write_all(b"{\"protocol\":\"rpc\"}\0").unwrap();
    let mut ack = [0u8; 14];
    stream.read_exact(&mut ack).unwrap();

    let params = "z".repeat(9000);
    let oversized = format!("{{\"method\":\"echo\",\"params\":[\"{params}\"]}}\0");
    let mut buf = Vec::new();

    // tail of the dropped request arrives well before the next request
    stream.write_all(oversized.as_bytes()).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    stream.write_all(b"{\"method\":\"hello\",\"params\":[\"x\"]}\0").unwrap();
    let response: Value = serde_json::from_slice(&read_until_nul(&mut stream, &mut buf)).unwrap();
    assert_eq!(response, json!({"jsonrpc": "2.0", "result": "x"}));

    // and in the same write as the next request
    let pipelined = format!("{oversized}{{\"method\":\"hello\",\"params\":[\"y\"]}}\0");
    stream.write_all(pipelined.as_bytes()).unwrap();
    let response: Value = serde_json::from_slice(&read_until_nul(&mut stream, &mut buf)).unwrap();
    assert_eq!(response, json!({"jsonrpc": "2.0", "result": "y"}));
}

#[test]
fn fire_and_forget_notify_still_runs_the_handler() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let client = RpcClient::connect(server.addr()).unwrap();
    client.notify("record", Some(json!(["fired"]))).unwrap();

    assert!(eventually(|| !server.log.lock().is_empty()));
    assert_eq!(server.log.lock()[0], json!(["fired"]));
}

// ─────────────────────────────────────────────────────────────────────────────
// Notify
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn notify_fans_out_and_survives_a_subscriber_closing() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut first = NotifyClient::subscribe(server.addr(), ["news"]).unwrap();
    let second = NotifyClient::subscribe(server.addr(), ["news", "weather"]).unwrap();
    let mut second = Some(second);

    assert_eq!(first.next_notification(false, None).unwrap(), None);

    server.notify.publish("news", json!({"headline": "one"})).unwrap();
    for client in [&mut first, second.as_mut().unwrap()] {
        let note = client.next_notification(true, Some(WAIT)).unwrap();
        assert_eq!(note, Some(json!({"headline": "one"})));
    }

    drop(second.take());
    server.notify.publish("news", json!({"headline": "two"})).unwrap();
    server.notify.publish("news", json!({"headline": "three"})).unwrap();
    assert_eq!(
        first.next_notification(true, Some(WAIT)).unwrap(),
        Some(json!({"headline": "two"}))
    );
    assert_eq!(
        first.next_notification(true, Some(WAIT)).unwrap(),
        Some(json!({"headline": "three"}))
    );
}

#[test]
fn notify_only_reaches_subscribers_of_the_service() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    let mut news = NotifyClient::subscribe(server.addr(), ["news"]).unwrap();
    let mut weather = NotifyClient::subscribe(server.addr(), ["weather"]).unwrap();

    server.notify.publish("weather", json!({"sky": "grey"})).unwrap();
    assert_eq!(
        weather.next_notification(true, Some(WAIT)).unwrap(),
        Some(json!({"sky": "grey"}))
    );
    assert_eq!(news.next_notification(true, Some(Duration::from_millis(200))).unwrap(), None);
}

#[test]
fn notify_handshake_with_undeclared_service_is_refused() {
    let server = start_server(tcp_config(ProtocolMode::Json));
    match NotifyClient::subscribe(server.addr(), ["sports"]) {
        Err(ClientError::HandshakeRefused) | Err(ClientError::Io(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("undeclared service was accepted"),
    }
}

#[test]
fn notify_services_are_registered_once() {
    let mut server = TransportServer::bind(tcp_config(ProtocolMode::Json)).unwrap();
    server.register_notify_services(["news"]).unwrap();
    assert!(matches!(
        server.register_notify_services(["weather"]),
        Err(TransportError::NotifyServicesAlreadyRegistered)
    ));
    assert!(server.notify_registry().is_declared("news"));
    assert!(!server.notify_registry().is_declared("weather"));
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket over raw sockets
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn websocket_text_request_gets_text_response() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut stream = ws_connect(server.addr(), "/", "json");

    ws_send(&mut stream, true, OpCode::Text, br#"{"method":"hello","params":["ws"]}"#);
    let (opcode, payload) = ws_read_frame(&mut stream);
    assert_eq!(opcode, OpCode::Text);
    let response: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response, json!({"jsonrpc": "2.0", "result": "ws"}));
}

#[test]
fn websocket_fragmented_request_matches_single_frame() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut stream = ws_connect(server.addr(), "/", "json");
    let request = br#"{"method":"echo","params":{"text":"fragmented across frames"}}"#;

    for _ in 0..5 {
        ws_send_fragmented(&mut stream, request);
        let (opcode, payload) = ws_read_frame(&mut stream);
        assert_eq!(opcode, OpCode::Text);
        let response: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response["result"], json!({"text": "fragmented across frames"}));
    }
}

#[test]
fn websocket_close_frame_is_answered_with_normal_closure() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut stream = ws_connect(server.addr(), "/", "json");

    ws_send(&mut stream, true, OpCode::Close, &1000u16.to_be_bytes());
    assert_eq!(ws_close_code(&mut stream), 1000);
    assert!(closed_by_server(&mut stream));
}

#[test]
fn websocket_binary_frame_is_rejected_with_1003() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut stream = ws_connect(server.addr(), "/", "json");

    ws_send(&mut stream, true, OpCode::Binary, &[1, 2, 3]);
    assert_eq!(ws_close_code(&mut stream), 1003);
    assert!(closed_by_server(&mut stream));
}

#[test]
fn websocket_ping_gets_pong_and_session_continues() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut stream = ws_connect(server.addr(), "/", "json");

    ws_send(&mut stream, true, OpCode::Ping, b"are you there");
    let (opcode, payload) = ws_read_frame(&mut stream);
    assert_eq!(opcode, OpCode::Pong);
    assert_eq!(payload, b"are you there");

    ws_send(&mut stream, true, OpCode::Text, br#"{"method":"hello","params":[2]}"#);
    let (_, payload) = ws_read_frame(&mut stream);
    assert_eq!(serde_json::from_slice::<Value>(&payload).unwrap()["result"], json!(2));
}

#[test]
fn websocket_oversized_message_is_rejected_with_1009() {
    let config = TransportConfig {
        max_request_len: 1024,
        ..tcp_config(ProtocolMode::WebSocket)
    };
    let server = start_server(config);
    let mut stream = ws_connect(server.addr(), "/", "json");

    // fits one socket read, so nothing is left unread when the server closes
    let params = "y".repeat(2000);
    let request = format!("{{\"method\":\"echo\",\"params\":[\"{params}\"]}}");
    ws_send(&mut stream, true, OpCode::Text, request.as_bytes());
    assert_eq!(ws_close_code(&mut stream), 1009);
}

#[test]
fn websocket_notify_subscription_uses_path_services() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut stream = ws_connect(server.addr(), "/notify/news+weather", "notify");

    server.notify.publish("weather", json!({"sky": "blue"})).unwrap();
    let (opcode, payload) = ws_read_frame(&mut stream);
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(serde_json::from_slice::<Value>(&payload).unwrap(), json!({"sky": "blue"}));
}

// ─────────────────────────────────────────────────────────────────────────────
// Auto-detection
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn auto_mode_binds_each_connection_separately() {
    let server = start_server(tcp_config(ProtocolMode::Auto));

    let mut ws = ws_connect(server.addr(), "/", "json");
    let mut json_client = RpcClient::connect(server.addr()).unwrap();

    ws_send(&mut ws, true, OpCode::Text, br#"{"method":"hello","params":["ws"]}"#);
    assert_eq!(json_client.call("hello", Some(json!(["json"]))).unwrap(), json!("json"));
    let (_, payload) = ws_read_frame(&mut ws);
    assert_eq!(serde_json::from_slice::<Value>(&payload).unwrap()["result"], json!("ws"));
}

#[test]
fn auto_mode_delivers_notifications_in_each_connections_framing() {
    let server = start_server(tcp_config(ProtocolMode::Auto));
    let mut plain = NotifyClient::subscribe(server.addr(), ["news"]).unwrap();
    let mut ws = ws_connect(server.addr(), "/news", "notify");

    server.notify.publish("news", json!({"n": 1})).unwrap();
    assert_eq!(plain.next_notification(true, Some(WAIT)).unwrap(), Some(json!({"n": 1})));
    let (opcode, payload) = ws_read_frame(&mut ws);
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(serde_json::from_slice::<Value>(&payload).unwrap(), json!({"n": 1}));
}

// ─────────────────────────────────────────────────────────────────────────────
// Unix sockets and hooks
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn unix_socket_serves_rpc_and_is_removed_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hub.sock");
    std::fs::write(&path, b"stale").unwrap();

    let server = start_server(TransportConfig {
        listeners: vec![Listener::unix(&path)],
        mode: ProtocolMode::Json,
        ..TransportConfig::default()
    });
    assert!(server.addr.is_none());

    let mut client = RpcClient::connect(path.clone()).unwrap();
    assert_eq!(client.call("hello", Some(json!(["unix"]))).unwrap(), json!("unix"));

    let mut subscriber = NotifyClient::subscribe(path.clone(), ["news"]).unwrap();
    server.notify.publish("news", json!("over unix")).unwrap();
    assert_eq!(
        subscriber.next_notification(true, Some(WAIT)).unwrap(),
        Some(json!("over unix"))
    );

    drop(server);
    assert!(!path.exists());
}

#[derive(Clone, Default)]
struct RecordingHooks {
    events: Arc<Mutex<Vec<String>>>,
}

impl Hooks for RecordingHooks {
    fn on_client_connected(&mut self, id: ConnectionId, peer: &PeerAddr) {
        assert!(matches!(peer, PeerAddr::Tcp(_)));
        self.events.lock().push(format!("connected {id}"));
    }

    fn on_client_closed(&mut self, id: ConnectionId) {
        self.events.lock().push(format!("closed {id}"));
    }
}

#[test]
fn hooks_see_connections_open_and_close() {
    let hooks = RecordingHooks::default();
    let events = hooks.events.clone();
    let server = start_server_with_hooks(tcp_config(ProtocolMode::Json), Box::new(hooks));

    let mut client = RpcClient::connect(server.addr()).unwrap();
    client.call("hello", None).unwrap();
    drop(client);

    assert!(eventually(|| events.lock().len() == 2));
    let events = events.lock();
    assert!(events[0].starts_with("connected conn-"));
    assert_eq!(events[1], events[0].replace("connected", "closed"));
}

/// Rewrites calls to `greet` into calls to `hello` before they are parsed.
struct AliasHooks {
    saw_handshaked: Arc<AtomicBool>,
}

impl Hooks for AliasHooks {
    fn on_request(&mut self, _id: ConnectionId, session: &Session, request: &mut Buffer) {
        if session.kind.is_some() {
            self.saw_handshaked.store(true, Ordering::SeqCst);
        }
        let bytes = request.as_mut_slice();
        for start in 0..bytes.len().saturating_sub(4) {
            if &bytes[start..start + 5] == b"greet" {
                bytes[start..start + 5].copy_from_slice(b"hello");
            }
        }
    }
}

#[test]
fn request_hook_can_rewrite_the_raw_request() {
    let saw_handshaked = Arc::new(AtomicBool::new(false));
    let hooks = AliasHooks {
        saw_handshaked: saw_handshaked.clone(),
    };
    let server = start_server_with_hooks(tcp_config(ProtocolMode::Json), Box::new(hooks));

    let mut client = RpcClient::connect(server.addr()).unwrap();
    assert_eq!(client.call("greet", Some(json!(["hi"]))).unwrap(), json!("hi"));
    assert!(saw_handshaked.load(Ordering::SeqCst));
}

/// Sends one `news` bulletin from the after-batch hook once someone listens.
struct BulletinHooks {
    delivered: Arc<Mutex<Option<usize>>>,
}

impl Hooks for BulletinHooks {
    fn on_processed(&mut self, notifier: &mut Notifier<'_>) {
        let mut delivered = self.delivered.lock();
        if delivered.is_some() || notifier.subscriber_count("news") == 0 {
            return;
        }
        *delivered = notifier.dispatch("news", &json!({"headline": "from the loop"})).ok();
    }
}

#[test]
fn after_batch_hook_dispatches_framed_notifications() {
    let delivered = Arc::new(Mutex::new(None));
    let hooks = BulletinHooks {
        delivered: delivered.clone(),
    };
    let server = start_server_with_hooks(tcp_config(ProtocolMode::Json), Box::new(hooks));

    let mut stream = raw_connect(server.addr());
    stream
        .write_all(b"{\"protocol\":\"notify\",\"notifyServiceNames\":[\"news\"]}\0")
        .unwrap();
    let mut ack = [0u8; 14];
    stream.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"handshake OK\r\n");

    let mut header = [0u8; 5];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[0], b'$');
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    assert_eq!(body.last(), Some(&0));
    let note: Value = serde_json::from_slice(&body[..len - 1]).unwrap();
    assert_eq!(note, json!({"headline": "from the loop"}));

    assert!(eventually(|| *delivered.lock() == Some(1)));
}

// ─────────────────────────────────────────────────────────────────────────────
// tokio-tungstenite clients
// ─────────────────────────────────────────────────────────────────────────────

async fn tungstenite_connect(
    addr: SocketAddr,
    path: &str,
    subprotocol: &'static str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(subprotocol));
    let (ws, response) = tokio_tungstenite::connect_async(request).await.expect("Failed to connect");
    assert_eq!(response.headers()["Sec-WebSocket-Protocol"], subprotocol);
    ws
}

#[tokio::test]
async fn tungstenite_client_round_trips_requests() {
    let server = start_server(tcp_config(ProtocolMode::Auto));
    let mut ws = tungstenite_connect(server.addr(), "/", "json").await;

    let request = json!({"method": "hello", "params": ["tungstenite"]});
    ws.send(Message::Text(serde_json::to_string(&request).unwrap().into())).await.unwrap();

    let msg = timeout(WAIT, ws.next())
        .await
        .expect("Timeout")
        .expect("Stream ended")
        .expect("WebSocket error");
    let text = msg.into_text().unwrap();
    let response: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(response, json!({"jsonrpc": "2.0", "result": "tungstenite"}));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn tungstenite_notify_fan_out_survives_a_subscriber_closing() {
    let server = start_server(tcp_config(ProtocolMode::WebSocket));
    let mut first = tungstenite_connect(server.addr(), "/news", "notify").await;
    let mut second = tungstenite_connect(server.addr(), "/news", "notify").await;

    server.notify.publish("news", json!({"headline": "one"})).unwrap();
    for ws in [&mut first, &mut second] {
        let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        let note: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
        assert_eq!(note, json!({"headline": "one"}));
    }

    drop(second);
    server.notify.publish("news", json!({"headline": "two"})).unwrap();
    let msg = timeout(WAIT, first.next()).await.unwrap().unwrap().unwrap();
    let note: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
    assert_eq!(note, json!({"headline": "two"}));
}
