use axum::{
    extract::{Path, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::AppState;

/// Client → server frames on the structured JSON channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    UserMessage { content: String },
    PermissionResponse { request_id: String, approved: bool },
}

/// GET /ws/streamjson/{session_id}
///
/// Full stored message history as one frame, then each live message as its
/// own frame. Accepts `user_message` and `permission_response` dispatches.
pub async fn streamjson_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state, session_id))
}

async fn handle(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sink, mut stream) = socket.split();

    let (Some(hub), Some(tracker)) = (
        state.supervisor.hub(&session_id),
        state.supervisor.tracker(&session_id),
    ) else {
        let frame = serde_json::json!({"type": "error", "message": "gone"}).to_string();
        let _ = sink.send(Message::Text(frame.into())).await;
        let _ = sink.close().await;
        return;
    };

    let mut live = hub.subscribe();
    let history = hub.history().await;
    let initial = serde_json::json!({"type": "history", "messages": history}).to_string();
    if sink.send(Message::Text(initial.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            message = live.recv() => match message {
                Ok(value) => {
                    let Ok(json) = serde_json::to_string(&value) else { continue };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("streamjson client for {session_id} lagged {n}, closing");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::UserMessage { content }) => {
                            if let Err(e) = hub.send_user_message(&tracker, &content).await {
                                debug!("user_message to {session_id}: {e}");
                            }
                        }
                        Ok(ClientMessage::PermissionResponse { request_id, approved }) => {
                            if let Err(e) = hub
                                .send_permission_response(&tracker, &request_id, approved)
                                .await
                            {
                                debug!("permission_response to {session_id}: {e}");
                            }
                        }
                        Err(e) => debug!("bad streamjson client frame: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    let _ = sink.close().await;
}
