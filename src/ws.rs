//! Chat socket endpoint
//!
//! Per-connection protocol loop: authenticate the handshake, register the
//! connection, interpret inbound frames, and fan committed messages out to
//! every live connection of both participants. Every exit route from the read
//! loop reaches unregister exactly once.

pub mod protocol;

#[cfg(test)]
mod proptests;

use crate::api::AppState;
use crate::registry::{ConnectionHandle, Outbound};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use protocol::{ClientAction, ServerEvent};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    token: Option<String>,
}

/// `GET /ws/chat?token=` - upgrade to the chat socket
pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SocketQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.token))
}

async fn handle_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let identity = token.as_deref().and_then(|t| state.auth.verify(t));
    match identity {
        Some(identity) => serve_connection(socket, state, identity).await,
        // Refused before any registry entry or status frame exists.
        None => refuse(socket).await,
    }
}

async fn refuse(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: "Missing or invalid token".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn serve_connection(socket: WebSocket, state: AppState, identity: Uuid) {
    let (handle, outbound_rx) = ConnectionHandle::new();
    let conn_id = handle.id();
    state.registry.register(identity, handle);
    debug!(%identity, %conn_id, "chat socket authenticated");

    let (mut sink, mut stream) = socket.split();

    // Status frame to the new connection only, before the writer takes the sink.
    let connected = ServerEvent::status("connected").to_frame();
    if sink.send(Message::Text(connected.to_string())).await.is_err() {
        state.registry.unregister(identity, conn_id);
        return;
    }

    let writer = tokio::spawn(write_outbound(sink, outbound_rx));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, identity, &text),
            Ok(Message::Close(_)) | Err(_) => break,
            // Binary, ping, and pong frames are ignored.
            Ok(_) => {}
        }
    }

    state.registry.unregister(identity, conn_id);
    writer.abort();
    debug!(%identity, %conn_id, "chat socket closed");
}

/// Drain the connection's outbound queue into the socket
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        match frame {
            Outbound::Frame(payload) => {
                if sink.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "Server shutting down".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

fn handle_frame(state: &AppState, sender: Uuid, raw: &str) {
    let action = match ClientAction::decode(raw) {
        Ok(action) => action,
        Err(_) => {
            emit(state, sender, &ServerEvent::error("Invalid payload"));
            return;
        }
    };
    match action {
        ClientAction::SendMessage {
            chat_id,
            recipient_id,
            content,
        } => handle_send_message(state, sender, chat_id, recipient_id, &content),
        ClientAction::Unknown { name } => {
            emit(state, sender, &ServerEvent::error(format!("Unknown action {name}")));
        }
    }
}

fn handle_send_message(
    state: &AppState,
    sender: Uuid,
    chat_id: Option<Uuid>,
    recipient_id: Option<Uuid>,
    content: &str,
) {
    // A given chat id wins; otherwise the canonical chat with the recipient
    // is derived (created if absent).
    let chat_id = match chat_id {
        Some(id) => id,
        None => {
            let Some(recipient) = recipient_id else {
                emit(state, sender, &ServerEvent::error("Recipient required"));
                return;
            };
            match state.db.ensure_chat(sender, recipient) {
                Ok(chat) => chat.id,
                Err(err) => {
                    emit(state, sender, &ServerEvent::error(err.to_string()));
                    return;
                }
            }
        }
    };

    let message = match state.db.add_message(chat_id, sender, content) {
        Ok(message) => message,
        Err(err) => {
            emit(state, sender, &ServerEvent::error(err.to_string()));
            return;
        }
    };

    // Serialized once; every device of both parties gets the same frame.
    let recipient = message.recipient_id;
    let frame = ServerEvent::message(message).to_frame();
    state.registry.send_to(sender, &frame);
    if recipient != sender {
        state.registry.send_to(recipient, &frame);
    }
}

fn emit(state: &AppState, identity: Uuid, event: &ServerEvent) {
    state.registry.send_to(identity, &event.to_frame());
}
