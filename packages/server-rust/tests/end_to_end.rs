//! Full-stack tests: a bound server on an ephemeral port, driven over TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rpcserve_core::{serial, ReplyEnvelope, RequestEnvelope};
use rpcserve_server::method::handler::BINARY_PARSE_ERROR;
use rpcserve_server::method::{CallContext, MockOutcome, RegistryBuilder, ServerMethod};
use rpcserve_server::network::http::url_encode;
use rpcserve_server::network::{
    ConnectionRegistry, NetworkConfig, RpcClient, ServeOutcome, ShutdownController, ShutdownKind,
};
use rpcserve_server::service::{RecordingConfig, RpcServer, ServerConfig};
use rpcserve_server::CallTracker;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Pair {
    a: i64,
    b: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Triple {
    a: i64,
    b: i64,
    c: i64,
}

struct Add;

#[async_trait]
impl ServerMethod for Add {
    type Input = Pair;
    type Output = i64;

    async fn call(&self, _ctx: &mut CallContext, input: Pair) -> Result<i64, String> {
        Ok(input.a + input.b)
    }

    async fn mock(&self, _ctx: &mut CallContext, mock_type: &str, _input: &Pair) -> MockOutcome<i64> {
        mock_type.parse().map_or(MockOutcome::Failure, MockOutcome::Success)
    }
}

struct Add3;

#[async_trait]
impl ServerMethod for Add3 {
    type Input = Triple;
    type Output = i64;

    async fn call(&self, ctx: &mut CallContext, input: Triple) -> Result<i64, String> {
        let ab: i64 = ctx.cascade("ADD", Pair { a: input.a, b: input.b }).await?;
        ctx.cascade("ADD", Pair { a: ab, b: input.c }).await
    }
}

/// Sleeps for the given number of milliseconds, then echoes it.
struct Sleep;

#[async_trait]
impl ServerMethod for Sleep {
    type Input = u64;
    type Output = u64;

    async fn call(&self, _ctx: &mut CallContext, millis: u64) -> Result<u64, String> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(millis)
    }
}

struct Swap;

#[async_trait]
impl ServerMethod for Swap {
    type Input = Pair;
    type Output = Pair;

    async fn call(&self, _ctx: &mut CallContext, input: Pair) -> Result<Pair, String> {
        Ok(Pair { a: input.b, b: input.a })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Empty {}

struct Ping;

#[async_trait]
impl ServerMethod for Ping {
    type Input = Empty;
    type Output = String;

    async fn call(&self, _ctx: &mut CallContext, _input: Empty) -> Result<String, String> {
        Ok("pong".to_string())
    }

    fn allow_empty_request(&self) -> bool {
        true
    }
}

struct Fail;

#[async_trait]
impl ServerMethod for Fail {
    type Input = Pair;
    type Output = i64;

    async fn call(&self, _ctx: &mut CallContext, _input: Pair) -> Result<i64, String> {
        Err("always fails".to_string())
    }
}

struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<ShutdownController>,
    connections: Arc<ConnectionRegistry>,
    tracker: Arc<CallTracker>,
    handle: JoinHandle<anyhow::Result<ServeOutcome>>,
}

impl TestServer {
    async fn start(network: NetworkConfig, config: ServerConfig) -> Self {
        let mut builder = RegistryBuilder::new();
        builder
            .register("calc", "ADD", Pair { a: 1, b: 10 }, Add)
            .unwrap()
            .register("calc", "ADD3", Triple { a: 1, b: 2, c: 3 }, Add3)
            .unwrap()
            .register("calc", "SLEEP", 10u64, Sleep)
            .unwrap()
            .register("calc", "SWAP", Pair { a: 1, b: 2 }, Swap)
            .unwrap()
            .register("calc", "PING", Empty {}, Ping)
            .unwrap()
            .register("calc", "FAIL", Pair::default(), Fail)
            .unwrap();
        let registry = builder.build(&config.identities);

        let bound = RpcServer::bind(config, network, registry).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], bound.port()));
        let shutdown = bound.shutdown_controller();
        let connections = bound.server().connections();
        let tracker = bound.server().tracker();
        let handle = tokio::spawn(bound.serve(std::future::pending()));
        Self {
            addr,
            shutdown,
            connections,
            tracker,
            handle,
        }
    }

    async fn with_defaults() -> Self {
        Self::start(network_config(), server_config()).await
    }

    async fn stop(self) -> ServeOutcome {
        self.shutdown.trigger_shutdown(ShutdownKind::Normal);
        self.handle.await.unwrap().unwrap()
    }
}

fn network_config() -> NetworkConfig {
    NetworkConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        drain_timeout: Duration::from_secs(5),
        drain_poll_interval: Duration::from_millis(20),
        ..NetworkConfig::default()
    }
}

fn server_config() -> ServerConfig {
    ServerConfig {
        identities: "calc".to_string(),
        ..ServerConfig::default()
    }
}

/// Sends one request on a fresh connection and reads until the server closes.
async fn exchange(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    raw
}

/// Sends one HTTP request on a fresh connection and returns (head, body).
async fn http(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
    split_response(&exchange(addr, request).await)
}

/// Finished calls recorded for `opname`.
fn calls(tracker: &CallTracker, opname: &str) -> u64 {
    tracker
        .snapshot()
        .into_iter()
        .find(|(name, _)| name == opname)
        .map_or(0, |(_, stat)| stat.count)
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let at = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header terminator");
    (
        String::from_utf8_lossy(&raw[..at]).into_owned(),
        raw[at + 4..].to_vec(),
    )
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n")
}

async fn read_reply(stream: &mut TcpStream) -> ReplyEnvelope {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let mut frame = prefix.to_vec();
    frame.resize(4 + u32::from_be_bytes(prefix) as usize, 0);
    stream.read_exact(&mut frame[4..]).await.unwrap();
    ReplyEnvelope::from_frame(&frame).unwrap()
}

fn add_frame(a: i64, b: i64) -> Vec<u8> {
    RequestEnvelope::with_input("ADD", &Pair { a, b })
        .unwrap()
        .to_frame()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Calling conventions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_over_binary_and_json() {
    let server = TestServer::with_defaults().await;

    let mut client = RpcClient::connect(server.addr).await.unwrap();
    let sum: i64 = client.call("ADD", &Pair { a: 1, b: 10 }).await.unwrap();
    assert_eq!(sum, 11);

    let q = url_encode(r#"{"a":1,"b":10}"#);
    let (head, body) = http(server.addr, &get(&format!("/ADD?q={q}"))).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(head.contains("application/json"));
    assert_eq!(String::from_utf8(body).unwrap().trim(), "11");

    server.stop().await;
}

#[tokio::test]
async fn split_binary_frame_is_answered_once() {
    let server = TestServer::with_defaults().await;
    let frame = add_frame(2, 3);

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&frame[..5]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(&frame[5..]).await.unwrap();

    let reply = read_reply(&mut stream).await;
    assert!(reply.success);
    assert_eq!(reply.output::<i64>().unwrap(), 5);

    server.stop().await;
}

#[tokio::test]
async fn keep_alive_replies_arrive_in_order() {
    let server = TestServer::with_defaults().await;

    let mut pipelined = add_frame(1, 1);
    pipelined.extend(add_frame(2, 2));
    pipelined.extend(add_frame(3, 3));
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&pipelined).await.unwrap();

    for expected in [2, 4, 6] {
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply.output::<i64>().unwrap(), expected);
    }

    server.stop().await;
}

#[tokio::test]
async fn unknown_binary_opname_closes_without_reply() {
    let server = TestServer::with_defaults().await;
    let frame = RequestEnvelope::with_input("NOPE", &1)
        .unwrap()
        .to_frame()
        .unwrap();

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_eq!(server.tracker.pending_count(), 0);
    assert_eq!(server.tracker.total_calls(), 0);
    assert_eq!(calls(&server.tracker, "NOPE"), 0);

    server.stop().await;
}

#[tokio::test]
async fn undecodable_payload_fails_and_keeps_connection() {
    let server = TestServer::with_defaults().await;
    let bad = RequestEnvelope::with_input("ADD", &"not a pair")
        .unwrap()
        .to_frame()
        .unwrap();

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&bad).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert!(!reply.success);
    assert_eq!(reply.error_message(), BINARY_PARSE_ERROR);

    stream.write_all(&add_frame(2, 3)).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert_eq!(reply.output::<i64>().unwrap(), 5);

    assert_eq!(server.tracker.pending_count(), 0);
    assert_eq!(calls(&server.tracker, "ADD"), 2);

    server.stop().await;
}

#[tokio::test]
async fn handler_error_is_tracked_once() {
    let server = TestServer::with_defaults().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let frame = RequestEnvelope::with_input("FAIL", &Pair { a: 1, b: 2 })
        .unwrap()
        .to_frame()
        .unwrap();
    stream.write_all(&frame).await.unwrap();
    let reply = read_reply(&mut stream).await;
    assert!(!reply.success);
    assert_eq!(reply.error_message(), "always fails");

    let q = url_encode(r#"{"a":1,"b":2}"#);
    let (head, body) = http(server.addr, &get(&format!("/FAIL?q={q}"))).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(String::from_utf8(body).unwrap().contains("always fails"));

    assert_eq!(server.tracker.pending_count(), 0);
    assert_eq!(calls(&server.tracker, "FAIL"), 2);
    assert_eq!(server.tracker.total_calls(), 2);

    server.stop().await;
}

#[tokio::test]
async fn cascade_runs_registered_methods() {
    let server = TestServer::with_defaults().await;
    let mut client = RpcClient::connect(server.addr).await.unwrap();
    let sum: i64 = client.call("ADD3", &Triple { a: 1, b: 2, c: 3 }).await.unwrap();
    assert_eq!(sum, 6);
    server.stop().await;
}

#[tokio::test]
async fn mock_argument_overrides_matching_method() {
    let server = TestServer::with_defaults().await;
    let q = url_encode(r#"{"a":1,"b":10}"#);

    let (_, body) = http(server.addr, &get(&format!("/ADD?q={q}&mock=*:42"))).await;
    assert_eq!(String::from_utf8(body).unwrap().trim(), "42");

    let (_, body) = http(server.addr, &get(&format!("/ADD?q={q}&mock=OTHER:42"))).await;
    assert_eq!(String::from_utf8(body).unwrap().trim(), "11");

    // Cascaded calls see the caller's mock arguments too.
    let q3 = url_encode(r#"{"a":1,"b":2,"c":3}"#);
    let (_, body) = http(server.addr, &get(&format!("/ADD3?q={q3}&mock=ADD:7"))).await;
    assert_eq!(String::from_utf8(body).unwrap().trim(), "7");

    server.stop().await;
}

#[tokio::test]
async fn missing_input_is_reported_as_json_error() {
    let server = TestServer::with_defaults().await;
    let (head, body) = http(server.addr, &get("/ADD")).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("Missing input (q)."), "{text}");
    server.stop().await;
}

// ---------------------------------------------------------------------------
// JSON call arguments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn callback_wraps_body_as_javascript() {
    let server = TestServer::with_defaults().await;
    let q = url_encode(r#"{"a":1,"b":10}"#);
    let (head, body) = http(server.addr, &get(&format!("/ADD?q={q}&callback=cb"))).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(head.contains("Content-Type: application/javascript"), "{head}");
    assert_eq!(body, b"cb(11);");
    server.stop().await;
}

#[tokio::test]
async fn header_zero_returns_bare_body_and_closes() {
    let server = TestServer::with_defaults().await;
    let q = url_encode(r#"{"a":1,"b":10}"#);
    let request = format!(
        "GET /ADD?q={q}&header=0 HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n"
    );
    let raw = exchange(server.addr, &request).await;
    assert_eq!(raw, b"11");

    let (head, _) = http(server.addr, &get(&format!("/ADD?q={q}&header=1"))).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    server.stop().await;
}

#[tokio::test]
async fn forced_error_skips_the_handler() {
    let server = TestServer::with_defaults().await;
    let q = url_encode(r#"{"a":1,"b":10}"#);
    let (head, body) = http(server.addr, &get(&format!("/ADD?q={q}&e=0"))).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(head.contains("application/json"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("\"error_msg\""), "{text}");
    assert!(text.contains("Caller-requested error."), "{text}");
    assert_eq!(calls(&server.tracker, "ADD"), 0);
    server.stop().await;
}

#[tokio::test]
async fn debug_argument_pretty_prints() {
    let server = TestServer::with_defaults().await;
    let q = url_encode(r#"{"a":1,"b":2}"#);

    let (_, body) = http(server.addr, &get(&format!("/SWAP?q={q}"))).await;
    assert_eq!(String::from_utf8(body).unwrap().trim(), r#"{"a":2,"b":1}"#);

    let (_, body) = http(server.addr, &get(&format!("/SWAP?q={q}&d=1"))).await;
    let pretty = String::from_utf8(body).unwrap();
    assert!(pretty.contains("\n  \"a\": 2"), "{pretty}");
    let value: serde_json::Value = serde_json::from_str(&pretty).unwrap();
    assert_eq!(value["b"], 1);

    server.stop().await;
}

#[tokio::test]
async fn empty_requests_decode_from_empty_object() {
    let server = TestServer::with_defaults().await;

    // The handler accepts a missing `q`.
    let (_, body) = http(server.addr, &get("/PING")).await;
    assert_eq!(String::from_utf8(body).unwrap().trim(), r#""pong""#);

    // `no_input` lifts the requirement for any handler.
    let (_, body) = http(server.addr, &get("/SWAP?no_input")).await;
    assert_eq!(String::from_utf8(body).unwrap().trim(), r#"{"a":0,"b":0}"#);

    server.stop().await;
}

#[tokio::test]
async fn rpc_tunnel_carries_binary_frames() {
    let server = TestServer::with_defaults().await;
    let frame = add_frame(20, 22);
    let mut request = format!(
        "POST /_rpc HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    )
    .into_bytes();
    request.extend_from_slice(&frame);

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&request).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let (head, body) = split_response(&raw);
    assert!(head.contains("application/octet-stream"));
    let reply = ReplyEnvelope::from_frame(&body).unwrap();
    assert_eq!(serial::from_binary::<i64>(&reply.payload).unwrap(), 42);

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Admin pages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_pages_respond() {
    let server = TestServer::with_defaults().await;

    let (_, body) = http(server.addr, &get("/")).await;
    let root = String::from_utf8(body).unwrap();
    assert!(root.contains("following 6 operations:"));

    let mut client = RpcClient::connect(server.addr).await.unwrap();
    let _: i64 = client.call("ADD", &Pair { a: 1, b: 1 }).await.unwrap();
    let (_, body) = http(server.addr, &get("/_usage")).await;
    let usage = String::from_utf8(body).unwrap();
    assert!(usage.contains("<td>ADD</td><td>1</td>"), "{usage}");

    let (_, body) = http(server.addr, &get("/_validate")).await;
    let report = String::from_utf8(body).unwrap();
    assert!(report.starts_with("Validating server..."));
    assert!(report.contains("FINAL STATUS"));

    let (_, body) = http(server.addr, &get("/_health")).await;
    assert_eq!(body, b"OK");

    let (head, _) = http(server.addr, &get("/no-such-file.txt")).await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");

    server.stop().await;
}

#[tokio::test]
async fn url_opname_redirects() {
    let server = TestServer::with_defaults().await;

    let (head, body) = http(server.addr, &get("/URL?http://example.com/next")).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(head.contains("Content-Type: text/html"));
    let page = String::from_utf8(body).unwrap();
    assert!(page.contains(r#"content="0;url=http://example.com/next""#), "{page}");

    let (head, _) = http(server.addr, &get("/URL")).await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");

    server.stop().await;
}

#[tokio::test]
async fn process_pages_are_plain_text() {
    let server = TestServer::with_defaults().await;

    let (head, body) = http(server.addr, &get("/_status")).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(head.contains("Content-Type: text/plain"));
    let status = String::from_utf8(body).unwrap();
    assert!(status.contains("Name:") || status.contains("not available"), "{status}");

    let (head, body) = http(server.addr, &get("/_threads")).await;
    assert!(head.contains("Content-Type: text/plain"));
    let threads = String::from_utf8(body).unwrap();
    assert!(threads.starts_with("runtime workers:"), "{threads}");
    assert!(threads.contains(" threads\n") || threads.contains("not available"), "{threads}");

    let (head, body) = http(server.addr, &get("/_param")).await;
    assert!(head.contains("Content-Type: text/plain"));
    let params = String::from_utf8(body).unwrap();
    assert!(params.contains("NetworkConfig"), "{params}");
    assert!(params.contains("ServerConfig"), "{params}");

    server.stop().await;
}

#[tokio::test]
async fn recording_captures_calls_between_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        recording: RecordingConfig {
            input_path: dir.path().join("in"),
            output_path: Some(dir.path().join("out")),
            max_duration: Duration::from_secs(60),
        },
        ..server_config()
    };
    let server = TestServer::start(network_config(), config).await;
    let port = server.addr.port();
    let q = url_encode(r#"{"a":1,"b":10}"#);

    let (head, body) = http(server.addr, &get("/_startrecord")).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"Recording started");

    http(server.addr, &get(&format!("/ADD?q={q}"))).await;

    let (_, body) = http(server.addr, &get("/_stoprecord")).await;
    assert_eq!(body, b"Recording stopped");
    http(server.addr, &get(&format!("/ADD?q={q}"))).await;

    let input = std::fs::read_to_string(dir.path().join(format!("in_{port}"))).unwrap();
    let lines: Vec<&str> = input.lines().collect();
    assert_eq!(lines.len(), 1, "{input}");
    assert!(lines[0].ends_with("\tADD\t{\"a\":1,\"b\":10}"), "{input}");

    let output = std::fs::read_to_string(dir.path().join(format!("out_{port}"))).unwrap();
    assert!(output.trim_end().ends_with("\tADD\ttrue\t11"), "{output}");

    server.stop().await;
}

#[tokio::test]
async fn static_files_are_served_from_webroot() {
    let webroot = tempfile::tempdir().unwrap();
    std::fs::write(webroot.path().join("hello.html"), "<p>hi</p>").unwrap();
    let config = ServerConfig {
        webroot: webroot.path().to_path_buf(),
        ..server_config()
    };
    let server = TestServer::start(network_config(), config).await;

    let (head, body) = http(server.addr, &get("/hello.html")).await;
    assert!(head.contains("text/html"));
    assert_eq!(body, b"<p>hi</p>");

    let (head, _) = http(server.addr, &get("/../etc/passwd")).await;
    assert!(head.starts_with("HTTP/1.1 404"));

    server.stop().await;
}

#[tokio::test]
async fn absolute_paths_do_not_escape_webroot() {
    let webroot = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.txt");
    std::fs::write(&secret, "TOP-SECRET").unwrap();
    let config = ServerConfig {
        webroot: webroot.path().to_path_buf(),
        ..server_config()
    };
    let server = TestServer::start(network_config(), config).await;

    let absolute = secret.to_str().unwrap().replace('\\', "/");
    let absolute = absolute.trim_start_matches('/');
    for path in [format!("//{absolute}"), format!("/%2F{absolute}")] {
        let (head, body) = http(server.addr, &get(&path)).await;
        assert!(head.starts_with("HTTP/1.1 404"), "{path}: {head}");
        assert!(!String::from_utf8_lossy(&body).contains("TOP-SECRET"));
    }

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Admission and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_over_limit_gets_busy_message() {
    let network = NetworkConfig {
        max_connections: 1,
        ..network_config()
    };
    let busy = network.busy_message.clone();
    let server = TestServer::start(network, server_config()).await;

    let _held = TcpStream::connect(server.addr).await.unwrap();
    while server.connections.count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut rejected = TcpStream::connect(server.addr).await.unwrap();
    let mut reply = Vec::new();
    rejected.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, busy.as_bytes());
    assert_eq!(server.connections.count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_drains_in_flight_call() {
    let server = TestServer::with_defaults().await;

    let mut slow = RpcClient::connect(server.addr).await.unwrap();
    let in_flight = tokio::spawn(async move { slow.call::<_, u64>("SLEEP", &300u64).await });
    while server.shutdown.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (_, body) = http(server.addr, &get("/_shutdown")).await;
    assert_eq!(body, b"Preparing to shutdown...\n");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(server.addr).await.is_err());

    assert_eq!(in_flight.await.unwrap().unwrap(), 300);
    let outcome = server.handle.await.unwrap().unwrap();
    assert!(outcome.drained);
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn shutdown_loop_exits_with_restart_code() {
    let server = TestServer::with_defaults().await;
    let (_, body) = http(server.addr, &get("/_shutdownloop")).await;
    assert_eq!(body, b"Preparing to shutdown...\n");
    let outcome = server.handle.await.unwrap().unwrap();
    assert_eq!(outcome.kind, ShutdownKind::Loop);
    assert_eq!(outcome.exit_code(), 100);
}
