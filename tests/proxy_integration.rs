//! Integration tests for the ticket proxy
//!
//! These spin up a real upstream backend, a real proxy listener, and real
//! WebSocket clients, and drive the whole ticket lifecycle over the wire.

use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use podgate::config::BackendConfig;
use podgate::proxy::ProxyServer;
use podgate::serverlist::Serverlist;

/// Spawn an upstream backend that reports what it saw.
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<Incoming>| async move {
                    let origin_host = req
                        .headers()
                        .get("x-origin-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let forwarded_host = req
                        .headers()
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let body = format!(
                        "path={} origin={} forwarded={}",
                        req.uri().path(),
                        origin_host,
                        forwarded_host
                    );
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

/// Bind a proxy for the given serverlist on an ephemeral port.
async fn spawn_proxy(list: Arc<Serverlist>, dns_mode: bool) -> (SocketAddr, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), list, dns_mode, shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, shutdown_tx)
}

/// Send a raw HTTP/1.1 GET and return (status code, full response text).
async fn http_get(
    addr: SocketAddr,
    host: &str,
    path: &str,
    cookie: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    if let Some(token) = cookie {
        request.push_str(&format!("Cookie: stoken={}\r\n", token));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    (status, response)
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(addr: SocketAddr, prefix: &str) -> WsClient {
    let url = format!("ws://{}/{}/ws", addr, prefix);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Read text frames until the next one arrives; pings are answered by the
/// client library while we poll.
async fn next_text(ws: &mut WsClient, timeout: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Parse a `tkn#<token>@<backend>` frame.
fn parse_ticket_frame(frame: &str) -> (String, String) {
    let payload = frame.strip_prefix("tkn#").expect("ticket frame");
    let (token, backend) = payload.split_once('@').expect("token@backend");
    (token.to_string(), backend.to_string())
}

#[tokio::test]
async fn test_steady_state_handshake() {
    let backend_addr = spawn_backend().await;
    let list = Serverlist::new("app");
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: backend_addr.to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    let mut ws = ws_connect(proxy_addr, "app").await;

    let welcome = next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(welcome, "msg#Welcome generating ticket!");

    let ticket_frame = next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let (token, backend) = parse_ticket_frame(&ticket_frame);
    assert_eq!(backend, "p1");
    assert_eq!(token.len(), 8);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    // clean close after delivery
    assert!(next_text(&mut ws, Duration::from_secs(5)).await.is_none());

    assert_eq!(list.available_tickets(), 0);
}

#[tokio::test]
async fn test_dispatch_with_valid_ticket() {
    let backend_addr = spawn_backend().await;
    let list = Serverlist::new("app");
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: backend_addr.to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    let mut ws = ws_connect(proxy_addr, "app").await;
    next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let frame = next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let (token, _) = parse_ticket_frame(&frame);

    let (status, response) =
        http_get(proxy_addr, "proxy.local", "/app/p1/hello", Some(&token)).await;
    assert_eq!(status, 200);
    // routing prefix stripped, rewrite headers set
    assert!(response.contains("path=/hello"));
    assert!(response.contains(&format!("origin={}", backend_addr)));
    assert!(response.contains("forwarded=proxy.local"));
}

#[tokio::test]
async fn test_dispatch_rejections() {
    let backend_addr = spawn_backend().await;
    let list = Serverlist::new("app");
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: backend_addr.to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    // no cookie
    let (status, body) = http_get(proxy_addr, "proxy.local", "/app/p1/hello", None).await;
    assert_eq!(status, 403);
    assert!(body.contains("No valid cookie!"));

    // cookie with an unknown token
    let (status, body) =
        http_get(proxy_addr, "proxy.local", "/app/p1/hello", Some("deadbeef")).await;
    assert_eq!(status, 403);
    assert!(body.contains("Forbidden"));

    // unknown backend
    let (status, _) = http_get(proxy_addr, "proxy.local", "/app/p9/hello", Some("deadbeef")).await;
    assert_eq!(status, 404);

    // outside the prefix
    let (status, _) = http_get(proxy_addr, "proxy.local", "/elsewhere", None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway() {
    let list = Serverlist::new("app");
    // nothing listens on this address
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: "127.0.0.1:1".to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    let mut ws = ws_connect(proxy_addr, "app").await;
    next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let frame = next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let (token, _) = parse_ticket_frame(&frame);

    let (status, _) = http_get(proxy_addr, "proxy.local", "/app/p1/hello", Some(&token)).await;
    assert_eq!(status, 502);

    // the ticket survives an upstream failure
    assert!(list.server("p1").unwrap().find_ticket(&token).is_some());
}

#[tokio::test]
async fn test_landing_page() {
    let list = Serverlist::new("app");
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    let (status, body) = http_get(proxy_addr, "proxy.local", "/app", None).await;
    assert_eq!(status, 200);
    assert!(body.contains("text/html"));

    let (status, _) = http_get(proxy_addr, "proxy.local", "/app/", None).await;
    assert_eq!(status, 200);

    // only GET is served
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(b"POST /app HTTP/1.1\r\nHost: proxy.local\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 405"));
}

#[tokio::test]
async fn test_dns_mode_dispatch() {
    let backend_addr = spawn_backend().await;
    let list = Serverlist::new("app");
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: backend_addr.to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), true).await;

    let mut ws = ws_connect(proxy_addr, "app").await;
    next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let frame = next_text(&mut ws, Duration::from_secs(5)).await.unwrap();
    let (token, _) = parse_ticket_frame(&frame);

    // the backend is named by the first host label; only the prefix is
    // stripped from the path
    let (status, response) = http_get(
        proxy_addr,
        "p1.alice.example.org",
        "/app/hello",
        Some(&token),
    )
    .await;
    assert_eq!(status, 200);
    assert!(response.contains("path=/hello"));
}

#[tokio::test]
async fn test_second_client_queues_until_ticket_expires() {
    let backend_addr = spawn_backend().await;
    let list = Serverlist::new("app");
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: backend_addr.to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    // the lease watchdog recycles expired tickets
    let (stop_tx, stop_rx) = watch::channel(false);
    let watchdog = tokio::spawn(Arc::clone(&list).run_ticket_watchdog(stop_rx));

    let mut first = ws_connect(proxy_addr, "app").await;
    next_text(&mut first, Duration::from_secs(5)).await.unwrap();
    let frame = next_text(&mut first, Duration::from_secs(5)).await.unwrap();
    let (first_token, _) = parse_ticket_frame(&frame);

    // the only slot is taken: the second client is queued
    let mut second = ws_connect(proxy_addr, "app").await;
    let welcome = next_text(&mut second, Duration::from_secs(5)).await.unwrap();
    assert_eq!(welcome, "msg#Welcome generating ticket!");

    // the first client sends no traffic, so its lease expires and the slot
    // goes to the queued client
    let frame = next_text(&mut second, Duration::from_secs(15))
        .await
        .expect("queued client served after expiry");
    let (second_token, backend) = parse_ticket_frame(&frame);
    assert_eq!(backend, "p1");
    assert_ne!(first_token, second_token);

    stop_tx.send(true).unwrap();
    watchdog.await.unwrap();
}

#[tokio::test]
async fn test_disconnected_client_leaves_the_queue() {
    let backend_addr = spawn_backend().await;
    let list = Serverlist::new("app");
    list.add_server(
        "p1",
        1,
        BackendConfig {
            host: backend_addr.to_string(),
            path: "/".to_string(),
        },
    )
    .unwrap();
    let (proxy_addr, _shutdown) = spawn_proxy(Arc::clone(&list), false).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let watchdog = tokio::spawn(Arc::clone(&list).run_ticket_watchdog(stop_rx));

    let mut first = ws_connect(proxy_addr, "app").await;
    next_text(&mut first, Duration::from_secs(5)).await.unwrap();
    next_text(&mut first, Duration::from_secs(5)).await.unwrap();
    assert_eq!(list.available_tickets(), 0);

    // a second client queues up, then gives up
    let mut second = ws_connect(proxy_addr, "app").await;
    next_text(&mut second, Duration::from_secs(5)).await.unwrap();
    second.send(Message::Close(None)).await.unwrap();
    drop(second);

    // once the first ticket expires the slot must be free again, not handed
    // to the abandoned waiter
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if list.available_tickets() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slot was not reclaimed"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(list.ticket_count(), 0);

    stop_tx.send(true).unwrap();
    watchdog.await.unwrap();
}
