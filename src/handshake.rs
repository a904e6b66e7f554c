//! The ticket handshake: a WebSocket protocol for acquiring a ticket
//!
//! A client opens `/{prefix}/ws` and is greeted immediately. It then waits
//! in the admission queue, kept informed every 10 seconds, until a slot
//! frees up; the ticket is delivered as a single `tkn#<token>@<backend>`
//! frame followed by a clean close. The connection is kept honest with
//! pings; a client that stops answering (or disconnects) loses its spot in
//! the queue.

use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::{HyperWebsocket, WebSocketStream};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::error::text_response;
use crate::serverlist::Serverlist;

/// Time allowed to write a message to the peer
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next pong message from the peer
const PONG_WAIT: Duration = Duration::from_secs(10);

/// Send pings to the peer with this period. Must be less than PONG_WAIT.
const PING_PERIOD: Duration = Duration::from_secs(5);

/// Period of the "please hold the line" notice while queued
const HOLD_MESSAGE_PERIOD: Duration = Duration::from_secs(10);

type WsSink = futures::stream::SplitSink<WebSocketStream<TokioIo<Upgraded>>, Message>;

/// Upgrade `/{prefix}/ws` and run the ticket handshake on the upgraded
/// connection.
pub async fn serve_ws(
    mut req: Request<Incoming>,
    serverlist: Arc<Serverlist>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "Expected WebSocket upgrade",
        ));
    }

    match hyper_tungstenite::upgrade(&mut req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                if let Err(e) = run_session(websocket, serverlist).await {
                    debug!(error = %e, "Ticket handshake session ended");
                }
            });
            Ok(response.map(|body| body.map_err(|never| match never {}).boxed()))
        }
        Err(e) => {
            warn!(error = %e, "WebSocket upgrade failed");
            Ok(text_response(StatusCode::BAD_REQUEST, "Bad request"))
        }
    }
}

async fn send_text(sink: &mut WsSink, text: &str) -> anyhow::Result<()> {
    tokio::time::timeout(WRITE_WAIT, sink.send(Message::text(text)))
        .await
        .map_err(|_| anyhow::anyhow!("write timed out"))??;
    Ok(())
}

async fn run_session(websocket: HyperWebsocket, serverlist: Arc<Serverlist>) -> anyhow::Result<()> {
    let ws = websocket.await?;
    let (mut sink, mut stream) = ws.split();
    info!(prefix = %serverlist.prefix(), "Ticket handshake connection opened");

    send_text(&mut sink, "msg#Welcome generating ticket!").await?;

    // the waiter's Drop cancels the queued admission request, so every early
    // return below gives the spot back
    let mut waiter = serverlist.enqueue_request();

    let mut hold_timer = interval_at(Instant::now() + HOLD_MESSAGE_PERIOD, HOLD_MESSAGE_PERIOD);
    let mut ping_timer = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    let read_deadline = tokio::time::sleep(PONG_WAIT);
    tokio::pin!(read_deadline);

    loop {
        tokio::select! {
            ticket = waiter.recv() => {
                match ticket {
                    Some(ticket) => {
                        let frame = format!("tkn#{}@{}", ticket.token(), ticket.backend_name());
                        send_text(&mut sink, &frame).await?;
                        let _ = sink.send(Message::Close(None)).await;
                        info!(
                            token = %ticket.token(),
                            backend = %ticket.backend_name(),
                            "Ticket delivered"
                        );
                    }
                    // shutdown: the reply slot vanished, close abruptly
                    None => debug!("Handshake ended before a ticket was issued"),
                }
                return Ok(());
            }
            _ = hold_timer.tick() => {
                send_text(&mut sink, "msg#Waiting for ticket, please hold the line!").await?;
            }
            _ = ping_timer.tick() => {
                tokio::time::timeout(WRITE_WAIT, sink.send(Message::Ping(Bytes::new().into())))
                    .await
                    .map_err(|_| anyhow::anyhow!("ping write timed out"))??;
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Pong(_))) => {
                        read_deadline.as_mut().reset(Instant::now() + PONG_WAIT);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed the handshake connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            _ = &mut read_deadline => {
                anyhow::bail!("pong deadline exceeded");
            }
        }
    }
}
