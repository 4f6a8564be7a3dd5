use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use tracing::{error, info, warn};

use crate::session::{ClientMessage, ProtocolError, SessionManager};

/// Shared state for the subscriber WebSocket endpoint.
pub struct WsAppState {
    pub sessions: Arc<SessionManager>,
}

pub fn create_ws_router(state: Arc<WsAppState>) -> Router {
    Router::new()
        .route("/events/live", get(ws_handler))
        .with_state(state)
}

/// GET /events/live - subscriber WebSocket upgrade
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsAppState>>) -> Response {
    info!("subscriber upgrade request received");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Drive one subscriber session: registry and snapshot frames up front, then
/// two concurrent loops (outbound dequeue → transmit, inbound read → route)
/// until either side ends.
async fn handle_socket(mut socket: WebSocket, state: Arc<WsAppState>) {
    let manager = &state.sessions;
    let (id, mut outbound) = manager.connect();

    manager.send_registry(id);
    if let Err(e) = manager.send_snapshot(id) {
        error!(session_id = %id, error = %e, "failed to build initial snapshot");
        manager.disconnect(id);
        return;
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(session_id = %id, error = %e, "failed to serialize outbound frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => route_frame(manager, id, &text),
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and pong frames are ignored
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %id, error = %e, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    manager.disconnect(id);
}

/// Decode and route one inbound text frame. Protocol errors are answered
/// with an error frame; the session stays open.
fn route_frame(manager: &SessionManager, id: uuid::Uuid, text: &str) {
    let routed = serde_json::from_str::<ClientMessage>(text)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
        .and_then(|message| manager.handle_message(id, message));

    if let Err(e) = routed {
        warn!(session_id = %id, error = %e, "protocol error");
        manager.send_error(id, e.to_string());
    }
}
