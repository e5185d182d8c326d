//! WebSocket endpoint handler.
//!
//! One connection moves through `Handshaking -> Open -> Closed`. On entering
//! `Open` the connection is registered for its session id, overwriting any
//! stale entry left by an earlier connection for the same session; the
//! server keeps no reconnection state of its own. All writes to the socket
//! go through a single writer task fed by the registry's bounded queue, so
//! replies and concurrently emitted telemetry are serialized per connection.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;

use pulse_protocol::{ChannelState, Envelope};

use crate::app::AppState;
use crate::error::ApiError;
use crate::registry::CONNECTION_BUFFER_SIZE;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    session_id: Option<String>,
}

/// WebSocket upgrade handler.
///
/// GET /ws?session_id=<opaque-string>
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing session_id query parameter"))?;

    info!("websocket upgrade for session {session_id}");
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, session_id)))
}

/// Drive one connection from handshake to close.
async fn handle_connection(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(CONNECTION_BUFFER_SIZE);
    let serial = state.registry.register(&session_id, tx);

    // Single writer per connection. Replies from the read loop and telemetry
    // from agent tasks both arrive through the registry queue.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    send_or_warn(
        &state,
        &session_id,
        Envelope::ChannelStatus {
            session_id: session_id.clone(),
            state: ChannelState::Connected,
        },
    );

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handle_frame(&state, &session_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!("session {session_id}: ignoring binary frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                debug!("session {session_id}: keepalive frame");
            }
            Ok(Message::Close(_)) => {
                info!("session {session_id}: peer closed connection");
                break;
            }
            Err(e) => {
                warn!("session {session_id}: transport error: {e}");
                break;
            }
        }
    }

    // Closed is terminal for this connection instance. A stale serial here
    // means a reconnect already replaced us; unregister is then a no-op.
    state.registry.unregister(&session_id, serial);
    write_task.abort();
    info!("session {session_id}: connection closed (serial {serial})");
}

/// Decode and dispatch one inbound frame. A bad frame answers with a
/// `channel_error` envelope; the connection stays open.
async fn handle_frame(state: &AppState, session_id: &str, text: &str) {
    match Envelope::decode(text) {
        Ok(Envelope::UserMessage {
            session_id: frame_session,
            content,
        }) => {
            if frame_session != session_id {
                warn!(
                    "session {session_id}: dropping user_message claiming session {frame_session}"
                );
                send_or_warn(
                    state,
                    session_id,
                    Envelope::ChannelError {
                        session_id: session_id.to_string(),
                        message: "envelope session_id does not match this channel".into(),
                    },
                );
                return;
            }

            let reply = match state.agent.respond(session_id, &content).await {
                Ok(output) => Envelope::AssistantReply {
                    session_id: session_id.to_string(),
                    content: output,
                    is_partial: false,
                },
                Err(e) => {
                    warn!("session {session_id}: agent failed: {e:#}");
                    Envelope::ChannelError {
                        session_id: session_id.to_string(),
                        message: e.to_string(),
                    }
                }
            };
            send_or_warn(state, session_id, reply);
        }
        Ok(other) => {
            debug!(
                "session {session_id}: ignoring {} frame from client",
                other.kind()
            );
        }
        Err(e) => {
            warn!("session {session_id}: undecodable frame: {e}");
            send_or_warn(
                state,
                session_id,
                Envelope::ChannelError {
                    session_id: session_id.to_string(),
                    message: format!("malformed frame: {e}"),
                },
            );
        }
    }
}

fn send_or_warn(state: &AppState, session_id: &str, envelope: Envelope) {
    if let Err(e) = state.registry.send(session_id, &envelope) {
        warn!(
            "session {session_id}: dropped {} frame: {e}",
            envelope.kind()
        );
    }
}
