//! Per-application HTTP listener and request dispatch
//!
//! Every request that should reach a backend has to carry a valid ticket
//! cookie. Dispatch resolves the backend by name (from the path, or from the
//! Host header in DNS mode), verifies the ticket, refreshes its lease, and
//! forwards the request through a pooled HTTP client. A background lease
//! refresher keeps long-lived responses alive for as long as the body is
//! streaming. WebSocket upgrades to the backend pass through transparently.

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::text_response;
use crate::handshake;
use crate::serverlist::Serverlist;
use crate::ticket::{Ticket, TICKET_INTERVAL};

/// Upstream dial timeout. There is no response timeout: long-polling
/// backends are expected.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for the original Host seen by the proxy
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for the upstream host the request was routed to
const X_ORIGIN_HOST: &str = "x-origin-host";

/// The landing page served at the application prefix. It performs the ticket
/// handshake in the browser, stores the cookie, and redirects to the backend.
const HOME_PAGE: &str = include_str!("../assets/home.html");

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// The HTTP listener of one application.
pub struct ProxyServer {
    listener: TcpListener,
    serverlist: Arc<Serverlist>,
    dns_mode: bool,
    client: Client<HttpConnector, Incoming>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener. Fails when the port is taken; the application is
    /// then degraded but its control loops keep running.
    pub async fn bind(
        addr: SocketAddr,
        serverlist: Arc<Serverlist>,
        dns_mode: bool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            listener,
            serverlist,
            dns_mode,
            client,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            prefix = %self.serverlist.prefix(),
            dns_mode = self.dns_mode,
            "Application proxy listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let serverlist = Arc::clone(&self.serverlist);
                            let client = self.client.clone();
                            let dns_mode = self.dns_mode;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, serverlist, client, dns_mode).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(prefix = %self.serverlist.prefix(), "Application proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    serverlist: Arc<Serverlist>,
    client: Client<HttpConnector, Incoming>,
    dns_mode: bool,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let serverlist = Arc::clone(&serverlist);
        let client = client.clone();
        async move { handle_request(req, serverlist, client, dns_mode).await }
    });

    // WebSocket upgrades (both the ticket handshake and pass-through to
    // backends) require the with-upgrades variant
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// How a request maps onto the application's URL surface.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    /// `/{prefix}` or `/{prefix}/` - the landing page
    Landing,
    /// `/{prefix}/ws` - the ticket handshake
    Handshake,
    /// A request to be forwarded to a backend
    Dispatch { backend: String, rest: String },
    NotFound,
}

/// Resolve the route for a request path (and, in DNS mode, its Host header).
fn route_request(prefix: &str, path: &str, host: Option<&str>, dns_mode: bool) -> Route {
    let root = format!("/{}", prefix);
    if path == root || path == format!("{}/", root) {
        return Route::Landing;
    }
    if path == format!("{}/ws", root) {
        return Route::Handshake;
    }

    if dns_mode {
        // Host: {backend}.{userTag}.{domain} with /{prefix}/{path...}
        let Some(host) = host else {
            return Route::NotFound;
        };
        let hostname = host.split(':').next().unwrap_or(host);
        let backend = match hostname.split('.').next() {
            Some(label) if !label.is_empty() => label,
            _ => return Route::NotFound,
        };
        match path.strip_prefix(&root) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => Route::Dispatch {
                backend: backend.to_string(),
                rest: rest.to_string(),
            },
            _ => Route::NotFound,
        }
    } else {
        // /{prefix}/{backend}/{path...}; anything after the backend segment
        // is forwarded opaquely (the first segment may be a user tag)
        let Some(tail) = path.strip_prefix(&format!("{}/", root)) else {
            return Route::NotFound;
        };
        let (backend, rest) = match tail.find('/') {
            Some(idx) => (&tail[..idx], &tail[idx..]),
            None => (tail, ""),
        };
        if backend.is_empty() {
            return Route::NotFound;
        }
        Route::Dispatch {
            backend: backend.to_string(),
            rest: rest.to_string(),
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    serverlist: Arc<Serverlist>,
    client: Client<HttpConnector, Incoming>,
    dns_mode: bool,
) -> Result<ProxyResponse, hyper::Error> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    match route_request(
        serverlist.prefix(),
        req.uri().path(),
        host.as_deref(),
        dns_mode,
    ) {
        Route::Landing => Ok(serve_home(&req)),
        Route::Handshake => handshake::serve_ws(req, serverlist).await,
        Route::Dispatch { backend, rest } => {
            dispatch(req, serverlist, client, backend, rest).await
        }
        Route::NotFound => Ok(text_response(StatusCode::NOT_FOUND, "Not found")),
    }
}

fn serve_home(req: &Request<Incoming>) -> ProxyResponse {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(
            http_body_util::Full::new(Bytes::from(HOME_PAGE))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

/// Extract a cookie value from the request headers.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(hyper::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Route a request to its backend: token check, lease refresh, forward.
async fn dispatch(
    mut req: Request<Incoming>,
    serverlist: Arc<Serverlist>,
    client: Client<HttpConnector, Incoming>,
    backend_name: String,
    rest: String,
) -> Result<ProxyResponse, hyper::Error> {
    let Some(backend) = serverlist.server(&backend_name) else {
        return Ok(text_response(StatusCode::NOT_FOUND, "Not found"));
    };

    let Some(token) = cookie_value(req.headers(), "stoken") else {
        return Ok(text_response(StatusCode::FORBIDDEN, "No valid cookie!"));
    };

    let Some(ticket) = backend.find_ticket(&token) else {
        return Ok(text_response(StatusCode::FORBIDDEN, "Forbidden"));
    };

    // active traffic keeps both leases alive
    backend.touch();
    ticket.touch();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    debug!(
        backend = %backend_name,
        token = %token,
        method = %req.method(),
        path = %req.uri().path(),
        request_id,
        "Dispatching request"
    );

    if is_upgrade_request(&req) {
        return proxy_upgrade(req, backend, ticket, rest, request_id).await;
    }

    let refresher = spawn_lease_refresher(ticket, Arc::clone(&backend));
    match forward(client, &backend, &rest, req, refresher).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(backend = %backend_name, request_id, error = %e, "Failed to forward request");
            Ok(text_response(StatusCode::BAD_GATEWAY, "Bad gateway"))
        }
    }
}

/// Forward a plain HTTP request through the pooled client.
///
/// The rewrite contract: Host and URI host become the backend address, the
/// scheme is http, the path is the backend's frozen path prefix plus the
/// remaining request path; `X-Forwarded-Host` carries the original host and
/// `X-Origin-Host` the backend address.
async fn forward(
    client: Client<HttpConnector, Incoming>,
    backend: &Backend,
    rest: &str,
    req: Request<Incoming>,
    refresher: RefreshGuard,
) -> anyhow::Result<ProxyResponse> {
    let upstream_host = backend.config().host.clone();
    let upstream_path = backend.config().upstream_path(rest);
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", upstream_path, query),
        None => upstream_path,
    };
    let uri = format!("http://{}{}", upstream_host, path_and_query);

    let original_host = req.headers().get(hyper::header::HOST).cloned();
    let (parts, body) = req.into_parts();
    let mut upstream_req = Request::builder()
        .method(parts.method)
        .uri(&uri)
        .body(body)
        .map_err(|e| anyhow::anyhow!("Request build error: {}", e))?;

    *upstream_req.headers_mut() = parts.headers;
    let headers = upstream_req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&upstream_host) {
        headers.insert(hyper::header::HOST, value.clone());
        headers.insert(X_ORIGIN_HOST, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let response = client.request(upstream_req).await?;
    let (parts, body) = response.into_parts();

    // the refresher lives as long as the response body streams
    let tracked = TrackedBody {
        inner: body.boxed(),
        _refresher: refresher,
    };
    Ok(Response::from_parts(parts, tracked.boxed()))
}

/// Cancels the lease-refresher task when dropped.
struct RefreshGuard {
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Keep the ticket and backend leases fresh while a response is in flight.
/// The period stays just under the watchdog interval so active connections
/// can never be evicted.
fn spawn_lease_refresher(ticket: Arc<Ticket>, backend: Arc<Backend>) -> RefreshGuard {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let period = TICKET_INTERVAL - Duration::from_millis(10);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    ticket.touch();
                    backend.touch();
                    debug!(token = %ticket.token(), "Refreshing ticket lease");
                }
                _ = &mut stop_rx => return,
            }
        }
    });
    RefreshGuard {
        stop: Some(stop_tx),
    }
}

/// Response body wrapper that holds the lease refresher until the body is
/// fully streamed (or the client goes away).
struct TrackedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    _refresher: RefreshGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request(req: &Request<Incoming>, upstream_host: &str, path: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", upstream_host));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the HTTP response head from the backend to check for 101 Switching
/// Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Pass a WebSocket upgrade through to the backend: relay the upgrade
/// request over a raw TCP connection and splice bytes in both directions.
/// The ticket lease is refreshed for the whole lifetime of the tunnel.
async fn proxy_upgrade(
    req: Request<Incoming>,
    backend: Arc<Backend>,
    ticket: Arc<Ticket>,
    rest: String,
    request_id: String,
) -> Result<ProxyResponse, hyper::Error> {
    let upstream_host = backend.config().host.clone();
    let upstream_path = backend.config().upstream_path(&rest);
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{}?{}", upstream_path, query),
        None => upstream_path,
    };

    let raw_request = build_upgrade_request(&req, &upstream_host, &path_and_query);

    let connect = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&upstream_host)).await;
    let mut backend_stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(host = %upstream_host, error = %e, "Failed to connect to backend for upgrade");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad gateway"));
        }
        Err(_) => {
            error!(host = %upstream_host, "Timed out connecting to backend for upgrade");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad gateway"));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(host = %upstream_host, error = %e, "Failed to send upgrade request to backend");
        return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad gateway"));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) | Err(_) => {
            error!(host = %upstream_host, "Backend closed connection before responding to upgrade");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad gateway"));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        error!(host = %upstream_host, "Failed to parse backend upgrade response");
        return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad gateway"));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host = %upstream_host, status = %status, "Backend rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(
                http_body_util::Empty::<Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response builder"));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(
            http_body_util::Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder");

    let backend_name = backend.name().to_string();
    tokio::spawn(async move {
        let _refresher = spawn_lease_refresher(ticket, backend);
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(backend = %backend_name, request_id, "Client upgrade complete, splicing");
                forward_bidirectional(upgraded, backend_stream, &backend_name, &request_id).await;
            }
            Err(e) => {
                error!(backend = %backend_name, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    backend_name: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                backend = %backend_name,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(backend = %backend_name, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_landing_and_handshake() {
        assert_eq!(route_request("app", "/app", None, false), Route::Landing);
        assert_eq!(route_request("app", "/app/", None, false), Route::Landing);
        assert_eq!(route_request("app", "/app/ws", None, false), Route::Handshake);
        assert_eq!(route_request("app", "/other", None, false), Route::NotFound);
    }

    #[test]
    fn test_route_path_mode() {
        assert_eq!(
            route_request("app", "/app/p1/index.html", None, false),
            Route::Dispatch {
                backend: "p1".to_string(),
                rest: "/index.html".to_string(),
            }
        );
        assert_eq!(
            route_request("app", "/app/p1", None, false),
            Route::Dispatch {
                backend: "p1".to_string(),
                rest: String::new(),
            }
        );
        // a user tag stays part of the forwarded path
        assert_eq!(
            route_request("app", "/app/p1/alice/data", None, false),
            Route::Dispatch {
                backend: "p1".to_string(),
                rest: "/alice/data".to_string(),
            }
        );
    }

    #[test]
    fn test_route_dns_mode() {
        assert_eq!(
            route_request("app", "/app/index.html", Some("p1.alice.example.org"), true),
            Route::Dispatch {
                backend: "p1".to_string(),
                rest: "/index.html".to_string(),
            }
        );
        assert_eq!(
            route_request("app", "/app/x", Some("p1.alice.example.org:443"), true),
            Route::Dispatch {
                backend: "p1".to_string(),
                rest: "/x".to_string(),
            }
        );
        assert_eq!(route_request("app", "/app/x", None, true), Route::NotFound);
        assert_eq!(
            route_request("app", "/elsewhere", Some("p1.alice.example.org"), true),
            Route::NotFound
        );
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::COOKIE,
            HeaderValue::from_static("theme=dark; stoken=31f4ef3d; lang=en"),
        );
        assert_eq!(
            cookie_value(&headers, "stoken"),
            Some("31f4ef3d".to_string())
        );
        assert_eq!(cookie_value(&headers, "session"), None);

        let empty = HeaderMap::new();
        assert_eq!(cookie_value(&empty, "stoken"), None);
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Upgrade" && value == "websocket"));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }
}
