//! The real-time channel: one WebSocket per authenticated user.
//!
//! Inbound text frames are negotiation payloads or pings; outbound frames
//! are whatever the relay queued for this connection.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use tandem_shared::constants::CONNECTION_QUEUE_CAPACITY;
use tandem_shared::{ClientFrame, ServerEvent, UserId};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::calls::CallService;
use crate::registry::ConnectionHandle;

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, user, socket))
}

async fn handle_socket(state: AppState, user: UserId, socket: WebSocket) {
    let (handle, mut outbound) = ConnectionHandle::new(CONNECTION_QUEUE_CAPACITY);
    let conn_id = handle.id();
    state.registry.register(user, handle);
    info!(user = %user.short(), conn = %conn_id, "signaling connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = outbound.recv() => {
                // `None` once a newer connection replaced this one.
                let Some(event) = event else {
                    debug!(user = %user.short(), conn = %conn_id, "connection superseded");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_frame(&state.calls, user, &text).await {
                            if send_event(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(user = %user.short(), error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.registry.unregister_connection(&user, conn_id);
    info!(user = %user.short(), conn = %conn_id, "signaling disconnected");
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(event = event.name(), error = %e, "failed to encode event");
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

/// Handle one inbound text frame. Returns the reply for the sender, if any.
pub async fn handle_frame(calls: &CallService, sender: UserId, text: &str) -> Option<ServerEvent> {
    let frame = match ClientFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user = %sender.short(), error = %e, "malformed client frame");
            return Some(ServerEvent::Error {
                kind: "bad_request".to_string(),
                message: format!("Malformed frame: {e}"),
            });
        }
    };

    let Some((call_id, signal)) = frame.into_signal() else {
        return Some(ServerEvent::Pong);
    };

    match calls.forward_signal(sender, call_id, signal).await {
        Ok(()) => None,
        Err(e) => {
            warn!(user = %sender.short(), call = %call_id, error = %e, "signal refused");
            Some(ServerEvent::Error {
                kind: e.kind().to_string(),
                message: e.public_message(),
            })
        }
    }
}
