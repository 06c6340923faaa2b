use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Git-derived stats cached on a workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStats {
    pub ahead: u32,
    pub behind: u32,
    pub files_changed: u32,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub dirty: bool,
}

/// Workspace-scoped configuration discovered from `.schmux/config.json`
/// inside the working copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub quick_launch: Vec<QuickLaunchEntry>,
    #[serde(default)]
    pub branch_url_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickLaunchEntry {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// A checked-out branch of a repository at a filesystem path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Human-readable, branch-derived id. Unique across the store.
    pub id: String,
    pub repo: String,
    pub branch: String,
    pub path: PathBuf,
    #[serde(default)]
    pub remote_host_id: Option<String>,
    #[serde(default)]
    pub stats: GitStats,
    #[serde(default)]
    pub ws_config: Option<WorkspaceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    Terminal,
    Html,
}

impl Default for RenderMode {
    fn default() -> Self {
        RenderMode::Terminal
    }
}

/// Agent-reported status, set by the nudge marker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeState {
    Working,
    NeedsInput,
    Completed,
    Error,
}

impl NudgeState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "working" => Some(NudgeState::Working),
            "needs_input" => Some(NudgeState::NeedsInput),
            "completed" => Some(NudgeState::Completed),
            "error" => Some(NudgeState::Error),
            _ => None,
        }
    }
}

/// One agent process inside a workspace under a multiplexer session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    /// Run-target name from config.
    pub target: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Multiplexer session name. Unique across the store.
    pub tmux_session: String,
    #[serde(default)]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_output_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nudge_state: Option<NudgeState>,
    #[serde(default)]
    pub nudge_summary: Option<String>,
    #[serde(default)]
    pub render_mode: RenderMode,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteHostStatus {
    Provisioning,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Expired,
}

impl RemoteHostStatus {
    /// Whether spawn logic may place new work on the host.
    pub fn is_usable(&self) -> bool {
        matches!(self, RemoteHostStatus::Connected)
    }
}

/// A live instance of a remote flavor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHost {
    pub id: String,
    pub flavor_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    pub status: RemoteHostStatus,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provisioning_session_id: Option<String>,
}

/// Read-only pull-request cache entry, refreshed by the discovery helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repo_url: String,
    pub number: u64,
    pub title: String,
    pub head_ref: String,
    pub author: String,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Linear-sync resolve-conflict trace
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Fetch,
    Rebase,
    Conflict,
    AskHelper,
    Apply,
    Continue,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStep {
    pub action: SyncAction,
    pub status: StepStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub file: String,
    pub confidence: f64,
    pub summary: String,
}

/// Per-workspace, per-attempt trace of a sync-with-rebase operation.
/// Retained after a terminal state until explicitly dismissed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub workspace_id: String,
    pub status: SyncStatus,
    #[serde(default)]
    pub hash: Option<String>,
    pub steps: Vec<SyncStep>,
    #[serde(default)]
    pub resolutions: Vec<ConflictResolution>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(workspace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            status: SyncStatus::InProgress,
            hash: None,
            steps: Vec::new(),
            resolutions: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// The persisted document: everything the supervisor must remember across
/// restarts. Written via temp-file + rename.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub remote_hosts: Vec<RemoteHost>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session {
            id: "sess-1".to_string(),
            workspace_id: "ws-main".to_string(),
            target: "claude".to_string(),
            nickname: Some("alpha".to_string()),
            prompt: Some("fix the bug".to_string()),
            tmux_session: "schmux-ws-main-1".to_string(),
            pid: Some(4242),
            created_at: "2025-01-01T00:00:00Z".parse().unwrap(),
            last_output_at: None,
            nudge_state: Some(NudgeState::Working),
            nudge_summary: Some("running tests".to_string()),
            render_mode: RenderMode::Terminal,
            running: true,
        }
    }

    #[test]
    fn session_serde_roundtrip() {
        let sess = sample_session();
        let json = serde_json::to_value(&sess).unwrap();
        assert_eq!(json["id"], "sess-1");
        assert_eq!(json["nudge_state"], "working");
        assert_eq!(json["render_mode"], "terminal");
        let rt: Session = serde_json::from_value(json).unwrap();
        assert_eq!(rt.id, sess.id);
        assert_eq!(rt.nudge_state, Some(NudgeState::Working));
    }

    #[test]
    fn session_defaults_for_missing_fields() {
        let json = serde_json::json!({
            "id": "s",
            "workspace_id": "w",
            "target": "shell",
            "tmux_session": "schmux-w-1",
            "created_at": "2025-01-01T00:00:00Z",
            "running": false,
        });
        let sess: Session = serde_json::from_value(json).unwrap();
        assert!(sess.nickname.is_none());
        assert!(sess.nudge_state.is_none());
        assert_eq!(sess.render_mode, RenderMode::Terminal);
    }

    #[test]
    fn nudge_state_parse() {
        assert_eq!(NudgeState::parse("working"), Some(NudgeState::Working));
        assert_eq!(
            NudgeState::parse("needs_input"),
            Some(NudgeState::NeedsInput)
        );
        assert_eq!(NudgeState::parse("completed"), Some(NudgeState::Completed));
        assert_eq!(NudgeState::parse("error"), Some(NudgeState::Error));
        assert_eq!(NudgeState::parse("bogus"), None);
    }

    #[test]
    fn remote_host_status_usable() {
        assert!(RemoteHostStatus::Connected.is_usable());
        assert!(!RemoteHostStatus::Provisioning.is_usable());
        assert!(!RemoteHostStatus::Expired.is_usable());
        assert!(!RemoteHostStatus::Disconnected.is_usable());
    }

    #[test]
    fn remote_host_status_serde_snake_case() {
        let json = serde_json::to_value(RemoteHostStatus::Reconnecting).unwrap();
        assert_eq!(json, "reconnecting");
    }

    #[test]
    fn sync_step_skips_absent_optionals() {
        let step = SyncStep {
            action: SyncAction::Fetch,
            status: StepStatus::Ok,
            message: "fetched origin".to_string(),
            timestamp: Utc::now(),
            local_commit: None,
            files: None,
            confidence: None,
            summary: None,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["action"], "fetch");
        assert!(json.get("files").is_none());
        assert!(json.get("confidence").is_none());
    }

    #[test]
    fn state_file_roundtrip_preserves_collections() {
        let state = StateFile {
            workspaces: vec![Workspace {
                id: "ws-main".to_string(),
                repo: "git@example.com:me/proj.git".to_string(),
                branch: "main".to_string(),
                path: PathBuf::from("/tmp/ws/ws-main"),
                remote_host_id: None,
                stats: GitStats {
                    ahead: 1,
                    behind: 2,
                    files_changed: 3,
                    lines_added: 4,
                    lines_removed: 5,
                    dirty: true,
                },
                ws_config: None,
            }],
            sessions: vec![sample_session()],
            remote_hosts: vec![],
            pull_requests: vec![PullRequest {
                repo_url: "git@example.com:me/proj.git".to_string(),
                number: 7,
                title: "Add feature".to_string(),
                head_ref: "feature/x".to_string(),
                author: "alice".to_string(),
                updated_at: "2025-01-02T00:00:00Z".parse().unwrap(),
            }],
        };

        let text = serde_json::to_string_pretty(&state).unwrap();
        let rt: StateFile = serde_json::from_str(&text).unwrap();
        assert_eq!(rt.workspaces.len(), 1);
        assert_eq!(rt.workspaces[0].stats.behind, 2);
        assert_eq!(rt.sessions[0].id, "sess-1");
        assert_eq!(rt.pull_requests[0].number, 7);
    }

    #[test]
    fn state_file_tolerates_missing_collections() {
        let rt: StateFile = serde_json::from_str("{}").unwrap();
        assert!(rt.workspaces.is_empty());
        assert!(rt.sessions.is_empty());
        assert!(rt.remote_hosts.is_empty());
        assert!(rt.pull_requests.is_empty());
    }
}
