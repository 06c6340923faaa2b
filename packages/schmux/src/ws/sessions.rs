use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::AppState;

/// Bursts of store mutations collapse into at most one snapshot per window.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Start the single coalescer task: it watches the store's generation
/// counter, debounces, and broadcasts a freshly shaped snapshot into the
/// channel the per-connection forwarders subscribe to. Slow websocket
/// clients fall off the broadcast channel and are closed.
pub fn spawn_snapshot_broadcaster(state: AppState, out: broadcast::Sender<String>) {
    tokio::spawn(async move {
        let mut changed = state.store.subscribe();
        loop {
            if changed.changed().await.is_err() {
                return;
            }
            tokio::time::sleep(COALESCE_WINDOW).await;
            changed.borrow_and_update();

            let snapshot = super::build_snapshot(
                &state.store.snapshot().await,
                state.sync.all_states().await,
            );
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    let _ = out.send(json);
                }
                Err(e) => debug!("snapshot serialization failed: {e}"),
            }
        }
    });
}

/// GET /ws/sessions
pub async fn sessions_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn handle(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Full snapshot on connect, then deltas-as-snapshots on every coalesced
    // store change.
    let snapshot = super::build_snapshot(
        &state.store.snapshot().await,
        state.sync.all_states().await,
    );
    let Ok(initial) = serde_json::to_string(&snapshot) else {
        return;
    };
    if sink.send(Message::Text(initial.into())).await.is_err() {
        return;
    }

    let mut updates = state.snapshots.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(json) => {
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Non-blocking broadcast policy: a client this far behind
                    // is closed rather than back-pressuring the plane.
                    debug!("sessions client lagged {n} snapshots, closing");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // snapshot channel is one-way
                Some(Err(_)) => break,
            },
        }
    }
}
