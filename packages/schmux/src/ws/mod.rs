pub mod sessions;
pub mod streamjson;
pub mod terminal;

use serde::Serialize;

use crate::models::{RemoteHost, Session, StateFile, SyncState, Workspace};

/// Messages the terminal and provisioning channels exchange. Output is sent
/// as lossy UTF-8 text for the browser emulator.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Bootstrap snapshot (scrollback capture), sent once on connect.
    Full { data: String },
    /// Live output delta.
    Append { data: String },
    Input { data: String },
    Resize { data: ResizeData },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ResizeData {
    pub cols: u16,
    pub rows: u16,
}

/// The full session-list snapshot pushed over `/ws/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionsSnapshot {
    pub workspaces: Vec<WorkspaceWithSessions>,
    pub sync_states: Vec<SyncState>,
    pub remote_hosts: Vec<RemoteHost>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceWithSessions {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub sessions: Vec<Session>,
}

/// Shape the snapshot from a state copy plus the live sync traces.
pub fn build_snapshot(state: &StateFile, sync_states: Vec<SyncState>) -> SessionsSnapshot {
    let workspaces = state
        .workspaces
        .iter()
        .map(|workspace| WorkspaceWithSessions {
            workspace: workspace.clone(),
            sessions: state
                .sessions
                .iter()
                .filter(|s| s.workspace_id == workspace.id)
                .cloned()
                .collect(),
        })
        .collect();
    SessionsSnapshot {
        workspaces,
        sync_states,
        remote_hosts: state.remote_hosts.clone(),
    }
}

/// Replies the browser emulator sends to multiplexer queries; forwarding
/// them as input would poison the stream. DA1 (`ESC [ ? ... c`), DA2
/// (`ESC [ > ... c`), and OSC 10/11 color replies.
pub fn is_terminal_query_reply(data: &[u8]) -> bool {
    if data.len() < 3 || data[0] != 0x1b {
        return false;
    }
    match data[1] {
        b'[' => {
            (data[2] == b'?' || data[2] == b'>') && data.last() == Some(&b'c')
        }
        b']' => {
            let rest = &data[2..];
            rest.starts_with(b"10;") || rest.starts_with(b"11;")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GitStats, RenderMode, SyncStatus};
    use chrono::Utc;
    use std::path::PathBuf;

    fn state_with_two_workspaces() -> StateFile {
        let workspace = |id: &str| Workspace {
            id: id.to_string(),
            repo: "r".to_string(),
            branch: id.to_string(),
            path: PathBuf::from(format!("/ws/{id}")),
            remote_host_id: None,
            stats: GitStats::default(),
            ws_config: None,
        };
        let session = |id: &str, ws: &str| Session {
            id: id.to_string(),
            workspace_id: ws.to_string(),
            target: "shell".to_string(),
            nickname: None,
            prompt: None,
            tmux_session: format!("schmux-{ws}-{id}"),
            pid: None,
            created_at: Utc::now(),
            last_output_at: None,
            nudge_state: None,
            nudge_summary: None,
            render_mode: RenderMode::Terminal,
            running: true,
        };
        StateFile {
            workspaces: vec![workspace("main"), workspace("dev")],
            sessions: vec![session("s1", "main"), session("s2", "dev"), session("s3", "main")],
            remote_hosts: vec![],
            pull_requests: vec![],
        }
    }

    #[test]
    fn snapshot_groups_sessions_by_workspace() {
        let snapshot = build_snapshot(&state_with_two_workspaces(), vec![]);
        assert_eq!(snapshot.workspaces.len(), 2);
        let main = &snapshot.workspaces[0];
        assert_eq!(main.workspace.id, "main");
        assert_eq!(main.sessions.len(), 2);
        assert_eq!(snapshot.workspaces[1].sessions.len(), 1);
    }

    #[test]
    fn snapshot_carries_sync_states() {
        let mut sync = SyncState::new("main");
        sync.status = SyncStatus::Done;
        let snapshot = build_snapshot(&state_with_two_workspaces(), vec![sync]);
        assert_eq!(snapshot.sync_states.len(), 1);
        assert_eq!(snapshot.sync_states[0].workspace_id, "main");
    }

    #[test]
    fn snapshot_serializes_workspace_fields_flat() {
        let snapshot = build_snapshot(&state_with_two_workspaces(), vec![]);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["workspaces"][0]["id"], "main");
        assert_eq!(json["workspaces"][0]["branch"], "main");
        assert!(json["workspaces"][0]["sessions"].is_array());
    }

    #[test]
    fn ws_message_serde_tags() {
        let json = serde_json::to_value(WsMessage::Full {
            data: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "full");
        let rt: WsMessage =
            serde_json::from_value(serde_json::json!({"type": "input", "data": "ls\n"})).unwrap();
        match rt {
            WsMessage::Input { data } => assert_eq!(data, "ls\n"),
            _ => panic!("expected input"),
        }
        let rt: WsMessage = serde_json::from_value(
            serde_json::json!({"type": "resize", "data": {"cols": 120, "rows": 40}}),
        )
        .unwrap();
        match rt {
            WsMessage::Resize { data } => {
                assert_eq!(data.cols, 120);
                assert_eq!(data.rows, 40);
            }
            _ => panic!("expected resize"),
        }
    }

    #[test]
    fn query_replies_detected() {
        // DA1 reply
        assert!(is_terminal_query_reply(b"\x1b[?1;2c"));
        // DA2 reply
        assert!(is_terminal_query_reply(b"\x1b[>0;276;0c"));
        // OSC 10/11 color replies
        assert!(is_terminal_query_reply(b"\x1b]10;rgb:ffff/ffff/ffff\x07"));
        assert!(is_terminal_query_reply(b"\x1b]11;rgb:0000/0000/0000\x07"));
    }

    #[test]
    fn normal_input_not_flagged() {
        assert!(!is_terminal_query_reply(b"ls -la\r"));
        assert!(!is_terminal_query_reply(b"\x1b[A")); // arrow key
        assert!(!is_terminal_query_reply(b"\x1b[Z")); // shift-tab
        assert!(!is_terminal_query_reply(b""));
        assert!(!is_terminal_query_reply(b"\x1b]0;title\x07"));
    }
}
