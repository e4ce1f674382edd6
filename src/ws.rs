//! NIP-01 WebSocket server.
//!
//! Each connection gets a reader loop and a writer task. The reader parses
//! inbound frames and calls into the relay; the writer drains the
//! connection's outbound queue into the socket. Nothing in the relay core
//! ever touches the socket directly.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::event::Event;
use crate::filter::Filter;
use crate::registry::{ConnId, OutFrame, Outbound};
use crate::relay::{PublishOutcome, Relay};

/// Start the WebSocket endpoint.
pub async fn serve_ws(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(relay);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move { process(socket, relay).await })
}

/// Drive one client connection until it closes or is dropped.
async fn process(socket: WebSocket, relay: Arc<Relay>) {
    let (conn, outbound) = relay.connect();
    debug!(conn, "connection opened");
    let (mut sink, mut stream) = socket.split();

    let writer_queue = outbound.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_queue.next().await {
            if sink
                .send(Message::Text(frame.to_json()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(txt) => handle_frame(&relay, conn, &outbound, &txt),
            Message::Close(_) => break,
            _ => {}
        }
        if outbound.is_closed() {
            break;
        }
    }

    relay.disconnect(conn);
    debug!(conn, "connection closed");
    let _ = writer.await;
}

/// Interpret one inbound text frame.
///
/// Malformed input yields a `NOTICE` and keeps the connection open; only the
/// transport layer decides when a connection dies.
fn handle_frame(relay: &Relay, conn: ConnId, outbound: &Outbound, txt: &str) {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        outbound.push(OutFrame::Notice {
            message: "could not parse message".into(),
        });
        return;
    };
    let Some(arr) = val.as_array() else {
        outbound.push(OutFrame::Notice {
            message: "message must be a JSON array".into(),
        });
        return;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 2 => {
            let ev: Event = match serde_json::from_value(arr[1].clone()) {
                Ok(ev) => ev,
                Err(e) => {
                    outbound.push(OutFrame::Notice {
                        message: format!("could not parse event: {e}"),
                    });
                    return;
                }
            };
            let event_id = ev.id.clone();
            let (accepted, message) = match relay.publish(ev) {
                Ok(PublishOutcome::Accepted) => (true, String::new()),
                Ok(PublishOutcome::Duplicate) => {
                    (true, "duplicate: already have this event".into())
                }
                Ok(PublishOutcome::Rejected(rejection)) => (false, rejection.to_string()),
                Ok(PublishOutcome::Exhausted) => (false, "error: event store is full".into()),
                Err(e) => (false, format!("error: {e}")),
            };
            outbound.push(OutFrame::Ok {
                event_id,
                accepted,
                message,
            });
        }
        Some("REQ") if arr.len() >= 3 => {
            let Some(sub_id) = arr[1].as_str() else {
                outbound.push(OutFrame::Notice {
                    message: "REQ subscription id must be a string".into(),
                });
                return;
            };
            let filters: Vec<Filter> = arr[2..].iter().filter_map(Filter::from_value).collect();
            if filters.is_empty() {
                outbound.push(OutFrame::Notice {
                    message: "REQ requires at least one valid filter".into(),
                });
                return;
            }
            relay.subscribe(conn, sub_id, filters);
        }
        Some("CLOSE") if arr.len() >= 2 => match arr[1].as_str() {
            Some(sub_id) => relay.unsubscribe(conn, sub_id),
            None => {
                outbound.push(OutFrame::Notice {
                    message: "CLOSE subscription id must be a string".into(),
                });
            }
        },
        _ => {
            outbound.push(OutFrame::Notice {
                message: "unknown message type".into(),
            });
        }
    }
}
