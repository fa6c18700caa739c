use crate::config::Config;
use crate::error::{
    error_response, ProxyErrorCode, BODY_READ_FAILED_MESSAGE, CONNECTION_REFUSED_MESSAGE,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Deadline used when the configured timeout does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handle the control loop uses to let one parked request through
pub type Release = oneshot::Sender<()>;

/// Rendezvous between request handlers and the control loop.
///
/// A request announces itself with a release handle and stays parked until the
/// control loop has decided whether to rerun the command and fires the handle.
#[derive(Clone)]
pub struct Gate {
    pending: mpsc::Sender<Release>,
}

impl Gate {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Release>) {
        let (pending, pending_rx) = mpsc::channel(capacity);
        (Self { pending }, pending_rx)
    }

    /// Block until the control loop releases this request
    pub async fn wait(&self) {
        let (release, released) = oneshot::channel();
        if self.pending.send(release).await.is_err() {
            debug!("gate: control loop stopped, passing through");
            return;
        }
        // A dropped release handle also lets the request through
        let _ = released.await;
    }
}

/// Last build/run failure. While set, requests are answered with the message
/// instead of being forwarded.
#[derive(Debug, Default)]
pub struct ErrorMode {
    message: RwLock<Option<String>>,
}

impl ErrorMode {
    pub fn set(&self, message: impl Into<String>) {
        debug!("proxy: error mode");
        *self.message.write() = Some(message.into());
    }

    pub fn clear(&self) {
        if self.message.write().take().is_some() {
            debug!("proxy: error mode cleared");
        }
    }

    pub fn get(&self) -> Option<String> {
        self.message.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.message.read().is_some()
    }
}

/// Statuses seen while retrying one request. Gateway errors are recorded here
/// and never reach the client.
#[derive(Debug, Default)]
pub struct AttemptLog {
    statuses: Vec<StatusCode>,
}

impl AttemptLog {
    pub fn record(&mut self, status: StatusCode) {
        self.statuses.push(status);
    }

    pub fn count(&self) -> usize {
        self.statuses.len()
    }

    pub fn last(&self) -> Option<StatusCode> {
        self.statuses.last().copied()
    }
}

/// Outcome of one forward attempt
enum Attempt {
    /// The app answered; relay this response
    Relayed(Response<BoxBody<Bytes, hyper::Error>>),
    /// The app is not ready yet (connection failed or it answered 502)
    Unavailable(StatusCode),
}

/// State shared by every request handler
struct ProxyState {
    app_port: u16,
    timeout: Duration,
    retry_backoff: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    gate: Gate,
    error_mode: Arc<ErrorMode>,
}

impl ProxyState {
    async fn forward(&self, parts: &Parts, body: Bytes) -> Attempt {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!("http://127.0.0.1:{}{}", self.app_port, path).parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(path, error = %e, "Cannot build upstream URI");
                return Attempt::Unavailable(StatusCode::BAD_GATEWAY);
            }
        };

        let mut upstream_req = Request::new(Full::new(body));
        *upstream_req.method_mut() = parts.method.clone();
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = parts.headers.clone();

        match self.client.request(upstream_req).await {
            Ok(response) if response.status() == StatusCode::BAD_GATEWAY => {
                Attempt::Unavailable(StatusCode::BAD_GATEWAY)
            }
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Attempt::Relayed(Response::from_parts(parts, body.boxed()))
            }
            Err(e) => {
                debug!(port = self.app_port, error = %e, "Upstream not reachable");
                Attempt::Unavailable(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// HTTP front for the app. Every request waits on the gate, then is retried
/// against the app until it answers or the request times out.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener. Failing to bind is the one fatal startup error.
    pub async fn bind(
        config: &Config,
        gate: Gate,
        error_mode: Arc<ErrorMode>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let bind_addr = format!("{}:{}", config.bind, config.proxy_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy on {}: {}", bind_addr, e))?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        let state = Arc::new(ProxyState {
            app_port: config.app_port,
            timeout: config.timeout(),
            retry_backoff: config.retry_backoff(),
            client,
            gate,
            error_mode,
        });

        Ok(Self {
            listener,
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, app_port = self.state.app_port, "Proxying requests");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, client_addr, state).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Buffer the body so every retry can replay it
    let (mut parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request_id, error = %e, "Failed to read request body");
            return Ok(error_response(
                ProxyErrorCode::BodyReadFailed,
                BODY_READ_FAILED_MESSAGE,
            ));
        }
    };

    strip_hop_by_hop(&mut parts.headers);
    set_forwarded_headers(&mut parts.headers, client_addr, &request_id);

    debug!(method = %parts.method, uri = %parts.uri, request_id, "Incoming request");

    state.gate.wait().await;

    let now = Instant::now();
    let deadline = now.checked_add(state.timeout).unwrap_or(now + FAR_FUTURE);
    let mut attempts = AttemptLog::default();

    loop {
        if let Some(message) = state.error_mode.get() {
            debug!(request_id, "Answering with command failure");
            return Ok(error_response(ProxyErrorCode::CommandFailed, message));
        }

        match state.forward(&parts, body.clone()).await {
            Attempt::Relayed(response) => {
                attempts.record(response.status());
                debug!(
                    request_id,
                    status = %response.status(),
                    attempts = attempts.count(),
                    "Relaying response"
                );
                return Ok(response);
            }
            Attempt::Unavailable(status) => attempts.record(status),
        }

        if tokio::time::timeout_at(deadline, tokio::time::sleep(state.retry_backoff))
            .await
            .is_err()
        {
            break;
        }
    }

    info!(
        request_id,
        attempts = attempts.count(),
        last_status = ?attempts.last(),
        timeout = ?state.timeout,
        "timeout reached"
    );
    Ok(error_response(
        ProxyErrorCode::ConnectionRefused,
        CONNECTION_REFUSED_MESSAGE,
    ))
}

/// Remove connection-scoped headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

// We overwrite X-Forwarded-* rather than appending: this proxy is the first hop.
fn set_forwarded_headers(headers: &mut HeaderMap, client_addr: SocketAddr, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}
