//! Integration tests for Tulpa

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tulpa::config::Config;
use tulpa::server::{Server, ServerHandle};

/// How the test app answers
#[derive(Clone, Copy)]
enum AppMode {
    /// Echo the request body
    Echo,
    /// Answer 502 for the first `n` requests, then echo
    BadGatewayFirst(usize),
    /// Always answer 502
    AlwaysBadGateway,
}

/// In-process stand-in for the app under development
struct TestApp {
    port: u16,
    hits: Arc<AtomicUsize>,
}

async fn start_app(mode: AppMode) -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let counter = Arc::clone(&counter);
                    async move { app_response(req, mode, &counter).await }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestApp { port, hits }
}

async fn app_response(
    req: Request<Incoming>,
    mode: AppMode,
    hits: &AtomicUsize,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let hit = hits.fetch_add(1, Ordering::SeqCst) + 1;
    let bad_gateway = match mode {
        AppMode::Echo => false,
        AppMode::BadGatewayFirst(n) => hit <= n,
        AppMode::AlwaysBadGateway => true,
    };
    if bad_gateway {
        return Ok(Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Full::new(Bytes::from_static(b"warming up")))
            .unwrap());
    }

    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("x-app-path", parts.uri.path())
        .header("x-app-method", parts.method.as_str())
        .header("x-saw-keep-alive", header("keep-alive"))
        .header("x-saw-custom", header("x-custom"))
        .header("x-saw-forwarded-proto", header("x-forwarded-proto"))
        .header("x-saw-request-id", header("x-request-id"))
        .body(Full::new(body))
        .unwrap())
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(root: &TempDir, app_port: u16) -> Config {
    Config {
        app_port,
        proxy_port: 0,
        root: root.path().to_path_buf(),
        debounce_ms: 0,
        timeout_ms: 2000,
        retry_backoff_ms: 20,
        ..Config::default()
    }
}

fn scratch_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a"), "a").unwrap();
    dir
}

async fn start(config: Config, command: &str) -> ServerHandle {
    // Keep the tree's mtimes strictly older than the watcher's first timestamp
    tokio::time::sleep(Duration::from_millis(20)).await;
    Server::new(config, vec![command.to_string()])
        .start()
        .await
        .expect("server starts")
}

fn touch(dir: &TempDir, name: &str) {
    let now = FileTime::from_system_time(SystemTime::now());
    filetime::set_file_mtime(dir.path().join(name), now).unwrap();
}

/// Parsed raw HTTP response
struct RawResponse {
    status: u16,
    head: String,
    body: String,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }
}

/// Send an HTTP request over a fresh connection and read until close
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    extra_headers: &str,
    body: &str,
) -> Result<RawResponse, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        extra_headers,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    read_response(&mut stream).await
}

/// Read until the server closes the connection and split the response
async fn read_response(
    stream: &mut TcpStream,
) -> Result<RawResponse, Box<dyn std::error::Error>> {
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let (head, body) = response
        .split_once("\r\n\r\n")
        .ok_or("malformed response")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .ok_or("missing status")?
        .parse()?;

    Ok(RawResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    })
}

async fn http_post(addr: SocketAddr, path: &str, body: &str) -> RawResponse {
    http_request(addr, "POST", path, "", body)
        .await
        .expect("request completes")
}

// ============================================================================
// Proxying
// ============================================================================

#[tokio::test]
async fn test_relays_response_and_body() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    let response = http_post(handle.addr(), "/items?page=2", "hello").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hello");
    assert_eq!(response.header("x-app-path"), Some("/items"));
    assert_eq!(response.header("x-app-method"), Some("POST"));
    assert_eq!(app.hits.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_forwarded_headers_and_hop_by_hop_stripping() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    let response = http_request(
        handle.addr(),
        "GET",
        "/",
        "Keep-Alive: timeout=5\r\nX-Custom: kept\r\nX-Request-ID: req-42\r\n",
        "",
    )
    .await
    .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-saw-keep-alive"), Some("-"));
    assert_eq!(response.header("x-saw-custom"), Some("kept"));
    assert_eq!(response.header("x-saw-forwarded-proto"), Some("http"));
    assert_eq!(response.header("x-saw-request-id"), Some("req-42"));

    handle.stop().await;
}

#[tokio::test]
async fn test_bad_gateway_is_retried_with_body_replayed() {
    let dir = scratch_tree();
    let app = start_app(AppMode::BadGatewayFirst(2)).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    let response = http_post(handle.addr(), "/", "payload").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "payload");
    assert_eq!(app.hits.load(Ordering::SeqCst), 3);

    handle.stop().await;
}

#[tokio::test]
async fn test_persistent_bad_gateway_times_out() {
    let dir = scratch_tree();
    let app = start_app(AppMode::AlwaysBadGateway).await;
    let mut config = test_config(&dir, app.port);
    config.timeout_ms = 300;
    let handle = start(config, "sleep 30").await;

    let started = std::time::Instant::now();
    let response = http_post(handle.addr(), "/", "").await;

    assert_eq!(response.status, 502);
    assert_eq!(response.body, "Connection Refused\n");
    assert_eq!(response.header("x-proxy-error"), Some("CONNECTION_REFUSED"));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(app.hits.load(Ordering::SeqCst) > 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_unbounded_timeout_still_relays() {
    let dir = scratch_tree();
    let app = start_app(AppMode::BadGatewayFirst(1)).await;
    let mut config = test_config(&dir, app.port);
    config.timeout_ms = u64::MAX;
    let handle = start(config, "sleep 30").await;

    let response = http_post(handle.addr(), "/", "big").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "big");

    handle.stop().await;
}

#[tokio::test]
async fn test_truncated_body_is_rejected() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
    let request = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nContent-Length: 100\r\nConnection: close\r\n\r\nabc",
        handle.addr()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let response = read_response(&mut stream).await.unwrap();

    assert_eq!(response.status, 500);
    assert_eq!(response.header("x-proxy-error"), Some("BODY_READ_FAILED"));
    assert_eq!(response.body, "Failed to read request body\n");
    assert_eq!(app.hits.load(Ordering::SeqCst), 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_unreachable_app_times_out() {
    let dir = scratch_tree();
    let port = closed_port().await;
    let mut config = test_config(&dir, port);
    config.timeout_ms = 200;
    let handle = start(config, "sleep 30").await;

    let response = http_post(handle.addr(), "/", "").await;

    assert_eq!(response.status, 502);
    assert_eq!(response.body, "Connection Refused\n");

    handle.stop().await;
}

#[tokio::test]
async fn test_app_coming_up_late_is_reached() {
    let dir = scratch_tree();
    let port = closed_port().await;
    let handle = start(test_config(&dir, port), "sleep 30").await;

    let addr = handle.addr();
    let request = tokio::spawn(async move { http_post(addr, "/", "late").await });

    // Bring the app up while the request is retrying
    tokio::time::sleep(Duration::from_millis(200)).await;
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hits = Arc::new(AtomicUsize::new(0));
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    async move { app_response(req, AppMode::Echo, &hits).await }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let response = request.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "late");

    handle.stop().await;
}

// ============================================================================
// Error mode
// ============================================================================

#[tokio::test]
async fn test_failed_command_is_served_as_500() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let mut config = test_config(&dir, app.port);
    config.wait = true;
    let handle = start(config, "printf boom >&2; exit 1").await;

    assert_eq!(handle.error_message().as_deref(), Some("boom"));

    let response = http_post(handle.addr(), "/", "").await;

    assert_eq!(response.status, 500);
    assert_eq!(response.body, "boom");
    assert_eq!(response.header("x-proxy-error"), Some("COMMAND_FAILED"));
    assert_eq!(app.hits.load(Ordering::SeqCst), 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_silent_failure_uses_placeholder_message() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let mut config = test_config(&dir, app.port);
    config.wait = true;
    let handle = start(config, "exit 3").await;

    let response = http_post(handle.addr(), "/", "").await;

    assert_eq!(response.status, 500);
    assert_eq!(
        response.body,
        "non-zero exit (but no output) from subprocess"
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_background_failure_enters_error_mode() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(
        test_config(&dir, app.port),
        "sleep 0.1; printf crashed >&2; exit 1",
    )
    .await;

    // Reported asynchronously once the command exits
    let mut message = None;
    for _ in 0..50 {
        message = handle.error_message();
        if message.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(message.as_deref(), Some("crashed"));

    let response = http_post(handle.addr(), "/", "").await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body, "crashed");

    handle.stop().await;
}

#[tokio::test]
async fn test_fixed_build_clears_error_mode() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let mut config = test_config(&dir, app.port);
    config.wait = true;
    // Fails until the `fixed` marker exists in the tree
    let command = format!(
        "test -e {}/fixed || {{ printf broken >&2; exit 1; }}",
        dir.path().display()
    );
    let handle = start(config, &command).await;

    let response = http_post(handle.addr(), "/", "").await;
    assert_eq!(response.status, 500);
    assert_eq!(response.body, "broken");

    std::fs::write(dir.path().join("fixed"), "").unwrap();
    let response = http_post(handle.addr(), "/", "ok").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
    assert_eq!(handle.error_message(), None);

    handle.stop().await;
}

// ============================================================================
// Reruns
// ============================================================================

#[tokio::test]
async fn test_rerun_only_when_tree_changed() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    assert_eq!(handle.run_count(), 1);
    let first_pid = handle.pid().expect("command running");

    let response = http_post(handle.addr(), "/", "one").await;
    assert_eq!(response.status, 200);
    assert_eq!(handle.scan_count(), 1);
    assert_eq!(handle.run_count(), 1);
    assert_eq!(handle.pid(), Some(first_pid));

    tokio::time::sleep(Duration::from_millis(20)).await;
    touch(&dir, "a");

    let response = http_post(handle.addr(), "/", "two").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "two");
    assert_eq!(handle.scan_count(), 2);
    assert_eq!(handle.run_count(), 2);
    let second_pid = handle.pid().expect("command restarted");
    assert_ne!(second_pid, first_pid);

    handle.stop().await;
}

#[tokio::test]
async fn test_new_file_triggers_rerun() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(dir.path().join("b"), "b").unwrap();

    let response = http_post(handle.addr(), "/", "").await;
    assert_eq!(response.status, 200);
    assert_eq!(handle.run_count(), 2);

    handle.stop().await;
}

#[tokio::test]
async fn test_ignored_directory_does_not_trigger_rerun() {
    let dir = scratch_tree();
    std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
    std::fs::write(dir.path().join("node_modules/pkg/index.js"), "").unwrap();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    touch(&dir, "node_modules/pkg/index.js");

    let response = http_post(handle.addr(), "/", "").await;
    assert_eq!(response.status, 200);
    assert_eq!(handle.run_count(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_burst_of_requests_reruns_once() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let mut config = test_config(&dir, app.port);
    config.debounce_ms = 200;
    config.debounce_ceiling_ms = 0;
    let handle = start(config, "sleep 30").await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    touch(&dir, "a");

    let addr = handle.addr();
    let requests: Vec<_> = (0..5)
        .map(|i| tokio::spawn(async move { http_post(addr, "/", &i.to_string()).await }))
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap().status, 200);
    }

    // Leading edge reran once; the trailing scan finds nothing new
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(handle.run_count(), 2);

    handle.stop().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_closes_listener() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let handle = start(test_config(&dir, app.port), "sleep 30").await;
    let addr = handle.addr();

    assert_eq!(http_post(addr, "/", "").await.status, 200);

    handle.stop().await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let dir = scratch_tree();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config(&dir, closed_port().await);
    config.proxy_port = taken.local_addr().unwrap().port();

    let result = Server::new(config, vec!["sleep 30".to_string()]).start().await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_env_overrides_reach_command() {
    let dir = scratch_tree();
    let app = start_app(AppMode::Echo).await;
    let mut config = test_config(&dir, app.port);
    config.wait = true;

    let handle = Server::new(
        config,
        vec!["test \"$TULPA_TEST\" = yes || exit 1".to_string()],
    )
    .with_env("TULPA_TEST", "yes")
    .start()
    .await
    .expect("server starts");

    assert_eq!(handle.error_message(), None);
    assert_eq!(http_post(handle.addr(), "/", "").await.status, 200);

    handle.stop().await;
}
