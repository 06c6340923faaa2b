use axum::{
    extract::{Path, State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use super::{WsMessage, is_terminal_query_reply};
use crate::AppState;
use crate::tracker::{StreamTracker, filter_bytes};

/// GET /ws/terminal/{session_id}
///
/// Bootstrap (filtered scrollback capture) as a single `full` frame, then
/// live tracker chunks as `append` frames. Client `input`/`resize` messages
/// flow back to the tracker.
pub async fn terminal_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state, session_id, true))
}

/// GET /ws/provision/{provisioning_session_id}
///
/// Identical framing to the terminal channel, but the target is an
/// interactive provisioner and the bootstrap is unfiltered.
pub async fn provision_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state, session_id, false))
}

async fn refuse(socket: WebSocket, message: &str) {
    let (mut sink, _) = socket.split();
    let frame = serde_json::to_string(&WsMessage::Error {
        message: message.to_string(),
    })
    .unwrap_or_default();
    let _ = sink.send(Message::Text(frame.into())).await;
    let _ = sink.close().await;
}

async fn handle(socket: WebSocket, state: AppState, session_id: String, filter_bootstrap: bool) {
    let Some(tracker) = state.supervisor.tracker(&session_id) else {
        refuse(socket, "gone").await;
        return;
    };
    // For agent sessions, also verify against the multiplexer; provisioning
    // sessions have no store record.
    if filter_bootstrap {
        match state.supervisor.is_running(&session_id).await {
            Ok(true) => {}
            _ => {
                refuse(socket, "gone").await;
                return;
            }
        }
    }

    let (mut sink, mut stream) = socket.split();

    // Live delta subscription first so nothing between capture and
    // subscribe is lost.
    let (sub_id, mut chunks) = tracker.subscribe();

    let scrollback = state.config.read().await.terminal.scrollback_lines;
    let sequences: Vec<Vec<u8>> = if filter_bootstrap {
        state
            .config
            .read()
            .await
            .terminal
            .filtered_sequences
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    } else {
        Vec::new()
    };

    let bootstrap = match state
        .supervisor
        .tmux()
        .capture_pane(&tracker.tmux_name(), scrollback, true)
        .await
    {
        Ok(raw) => filter_bytes(&sequences, &raw),
        Err(e) => {
            debug!("bootstrap capture for {session_id} failed: {e}");
            Vec::new()
        }
    };
    let full = WsMessage::Full {
        data: String::from_utf8_lossy(&bootstrap).into_owned(),
    };
    if send_json(&mut sink, &full).await.is_err() {
        tracker.unsubscribe(sub_id);
        return;
    }

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(bytes) => {
                    let append = WsMessage::Append {
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    if send_json(&mut sink, &append).await.is_err() {
                        break;
                    }
                }
                // Tracker closed us: session ended or we fell behind.
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &tracker, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    tracker.unsubscribe(sub_id);
    let _ = sink.close().await;
}

async fn handle_client_message(state: &AppState, tracker: &StreamTracker, text: &str) {
    let Ok(message) = serde_json::from_str::<WsMessage>(text) else {
        debug!("unparseable client frame: {text:?}");
        return;
    };
    match message {
        WsMessage::Input { data } => {
            let bytes = data.as_bytes();
            // Emulator replies to multiplexer queries are not user input.
            if is_terminal_query_reply(bytes) {
                return;
            }
            if let Err(e) = tracker.send_input(bytes).await {
                debug!("input to {} failed: {e}", tracker.tmux_name());
            }
        }
        WsMessage::Resize { data } => {
            // Dedup: skip when the window is already this size.
            let current = state
                .supervisor
                .tmux()
                .get_window_size(&tracker.tmux_name())
                .await
                .ok();
            if current == Some((data.cols, data.rows)) {
                return;
            }
            if let Err(e) = tracker.resize(data.cols, data.rows).await {
                debug!("resize of {} failed: {e}", tracker.tmux_name());
            }
        }
        _ => {}
    }
}

async fn send_json(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &WsMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    sink.send(Message::Text(json.into())).await
}
