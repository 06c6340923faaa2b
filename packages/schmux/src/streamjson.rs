use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::error::{Result, SchmuxError};
use crate::tracker::StreamTracker;

/// Known structured-JSON message kinds. Anything else is logged and not
/// surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Assistant,
    User,
    System,
    Result,
    PermissionRequest,
    Unknown,
}

pub fn classify(message: &Value) -> MessageKind {
    match message.get("type").and_then(Value::as_str) {
        Some("assistant") => MessageKind::Assistant,
        Some("user") => MessageKind::User,
        Some("system") => MessageKind::System,
        Some("result") => MessageKind::Result,
        Some("permission_request") => MessageKind::PermissionRequest,
        _ => MessageKind::Unknown,
    }
}

/// Line buffers larger than this are dropped; a stream-json agent that emits
/// megabyte-long unterminated lines is not speaking the protocol.
const MAX_LINE: usize = 1024 * 1024;

/// Per-session store and fan-out for an agent's structured JSON stream
/// (html render mode). Fed line-wise from the session's tracker output.
pub struct StreamJsonHub {
    session_id: String,
    history: Mutex<Vec<Value>>,
    live: broadcast::Sender<Value>,
    line_buf: Mutex<Vec<u8>>,
}

impl StreamJsonHub {
    pub fn new(session_id: &str) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            session_id: session_id.to_string(),
            history: Mutex::new(Vec::new()),
            live,
            line_buf: Mutex::new(Vec::new()),
        }
    }

    /// Feed raw output bytes; complete JSON lines become messages.
    pub async fn feed(&self, chunk: &[u8]) {
        let lines = {
            let mut buf = self.line_buf.lock().await;
            buf.extend_from_slice(chunk);
            let mut lines = Vec::new();
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                lines.push(line);
            }
            if buf.len() > MAX_LINE {
                buf.clear();
            }
            lines
        };

        for line in lines {
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            if classify(&message) == MessageKind::Unknown {
                debug!(
                    "session {}: unknown stream-json message type {:?}",
                    self.session_id,
                    message.get("type")
                );
                continue;
            }
            self.history.lock().await.push(message.clone());
            let _ = self.live.send(message);
        }
    }

    pub async fn history(&self) -> Vec<Value> {
        self.history.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.live.subscribe()
    }

    /// Forward a user message to the agent's stdin as a JSON line.
    pub async fn send_user_message(&self, tracker: &StreamTracker, content: &str) -> Result<()> {
        let line = serde_json::json!({"type": "user_message", "content": content});
        self.write_line(tracker, &line).await
    }

    /// Forward a permission decision to the agent's stdin.
    pub async fn send_permission_response(
        &self,
        tracker: &StreamTracker,
        request_id: &str,
        approved: bool,
    ) -> Result<()> {
        let line = serde_json::json!({
            "type": "permission_response",
            "request_id": request_id,
            "approved": approved,
        });
        self.write_line(tracker, &line).await
    }

    async fn write_line(&self, tracker: &StreamTracker, line: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(line)
            .map_err(|e| SchmuxError::Fatal(format!("encoding stream-json line: {e}")))?;
        bytes.push(b'\n');
        tracker.send_input(&bytes).await
    }
}

/// Hubs keyed by session id; only html render mode sessions have one.
#[derive(Default)]
pub struct StreamJsonRegistry {
    hubs: StdMutex<HashMap<String, std::sync::Arc<StreamJsonHub>>>,
}

impl StreamJsonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: &str, hub: std::sync::Arc<StreamJsonHub>) {
        self.hubs
            .lock()
            .unwrap()
            .insert(session_id.to_string(), hub);
    }

    pub fn get(&self, session_id: &str) -> Option<std::sync::Arc<StreamJsonHub>> {
        self.hubs.lock().unwrap().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.hubs.lock().unwrap().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_kinds() {
        assert_eq!(
            classify(&serde_json::json!({"type": "assistant"})),
            MessageKind::Assistant
        );
        assert_eq!(
            classify(&serde_json::json!({"type": "result", "ok": true})),
            MessageKind::Result
        );
        assert_eq!(
            classify(&serde_json::json!({"type": "permission_request", "request_id": "r1"})),
            MessageKind::PermissionRequest
        );
    }

    #[test]
    fn classify_unknown_and_untyped() {
        assert_eq!(
            classify(&serde_json::json!({"type": "telemetry"})),
            MessageKind::Unknown
        );
        assert_eq!(classify(&serde_json::json!({"no": "type"})), MessageKind::Unknown);
        assert_eq!(classify(&serde_json::json!(42)), MessageKind::Unknown);
    }

    #[tokio::test]
    async fn feed_parses_complete_lines() {
        let hub = StreamJsonHub::new("s1");
        hub.feed(b"{\"type\":\"assistant\",\"content\":\"hi\"}\n").await;
        let history = hub.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["content"], "hi");
    }

    #[tokio::test]
    async fn feed_reassembles_split_lines() {
        let hub = StreamJsonHub::new("s1");
        hub.feed(b"{\"type\":\"assist").await;
        assert!(hub.history().await.is_empty());
        hub.feed(b"ant\",\"n\":1}\n{\"type\":\"result\"}\n").await;
        let history = hub.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["n"], 1);
        assert_eq!(history[1]["type"], "result");
    }

    #[tokio::test]
    async fn feed_drops_unknown_and_nonjson() {
        let hub = StreamJsonHub::new("s1");
        hub.feed(b"plain terminal noise\n{\"type\":\"mystery\"}\n{\"type\":\"user\"}\n")
            .await;
        let history = hub.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["type"], "user");
    }

    #[tokio::test]
    async fn live_subscribers_see_new_messages() {
        let hub = StreamJsonHub::new("s1");
        let mut rx = hub.subscribe();
        hub.feed(b"{\"type\":\"system\",\"subtype\":\"init\"}\n").await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["subtype"], "init");
    }

    #[test]
    fn registry_insert_get_remove() {
        let registry = StreamJsonRegistry::new();
        registry.insert("s1", std::sync::Arc::new(StreamJsonHub::new("s1")));
        assert!(registry.get("s1").is_some());
        registry.remove("s1");
        assert!(registry.get("s1").is_none());
    }
}
