//! WebSocket signaling endpoint
//!
//! Each connection gets a [`Session`] and a writer task. Requests are handled
//! in arrival order on the reading side; responses and room pushes share the
//! writer so frames for one client never interleave.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use debate_sfu::{PeerChannel, ServerEvent};

use crate::http::AppState;
use crate::protocol::{ClientFrame, ErrorBody, ResponseFrame};
use crate::session::Session;

/// Signaling endpoint
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let max_message_size = state.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(frame: &impl Serialize) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!(error = %e, "Failed to serialize signaling frame");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<ResponseFrame>();
    let mut session = Session::new(state.registry.clone(), PeerChannel::from_sender(events_tx));
    let peer_id = session.peer_id().clone();
    info!(peer_id = %peer_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(reply) = replies_rx.recv() => encode(&reply),
                Some(event) = events_rx.recv() => encode(&event),
                else => break,
            };
            let Some(message) = message else {
                continue;
            };
            if let Err(e) = ws_sink.send(message).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    while let Some(message) = ws_stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "WebSocket receive failed");
                break;
            }
        };

        let frame = match ClientFrame::parse(text.as_str()) {
            Ok(frame) => frame,
            Err(body) => {
                warn!(peer_id = %peer_id, message = %body.message, "Dropping malformed frame");
                continue;
            }
        };

        let result = match frame.request() {
            Ok(request) => session.handle(request).await.map_err(|e| {
                debug!(peer_id = %peer_id, event = %frame.event, error = %e, "Request failed");
                ErrorBody::from(&e)
            }),
            Err(body) => Err(body),
        };

        match (frame.id, result) {
            (Some(id), Ok(data)) => {
                let _ = replies_tx.send(ResponseFrame::ok(id, data.unwrap_or(serde_json::Value::Null)));
            }
            (Some(id), Err(body)) => {
                let _ = replies_tx.send(ResponseFrame::error(id, body));
            }
            (None, Err(body)) => {
                warn!(peer_id = %peer_id, event = %frame.event, code = %body.code, message = %body.message, "Unanswered request failed");
            }
            (None, Ok(_)) => {}
        }
    }

    session.disconnect();
    // the peer's channel may outlive the session in pending room tasks
    writer.abort();
    info!(peer_id = %peer_id, "WebSocket connection closed");
}
