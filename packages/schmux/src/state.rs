use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, watch};
use tracing::{debug, warn};

use crate::error::SchmuxError;
use crate::models::{PullRequest, RemoteHost, Session, StateFile, Workspace};

/// Single source of truth for all persisted model objects.
///
/// One writer lock serializes mutations; readers clone snapshots. Every
/// successful mutation bumps a generation counter on a watch channel the
/// broadcast plane subscribes to.
pub struct StateStore {
    path: PathBuf,
    inner: RwLock<Inner>,
    changed: watch::Sender<u64>,
}

struct Inner {
    state: StateFile,
    generation: u64,
}

impl StateStore {
    /// Load from disk. A missing file is a fresh start; corrupt content is
    /// fatal (the process must not run against a state it cannot read).
    pub fn load(path: &Path) -> Result<Self> {
        let state = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<StateFile>(&text)
                .with_context(|| format!("corrupt state file at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state file at {}, starting fresh", path.display());
                StateFile::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        let (changed, _) = watch::channel(0);
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(Inner {
                state,
                generation: 0,
            }),
            changed,
        })
    }

    /// Write the full document to a sibling temp file, then rename over the
    /// target. Readers after a crash see either the old or the new state.
    pub async fn save(&self) -> Result<()> {
        let (text, generation) = {
            let inner = self.inner.read().await;
            (
                serde_json::to_string_pretty(&inner.state)?,
                inner.generation,
            )
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &text)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming over {}", self.path.display()))?;
        debug!("state saved (generation {generation})");
        Ok(())
    }

    /// Current generation; bumped by every mutation.
    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Bump the generation without mutating the model. Used by components
    /// whose derived state (sync traces) feeds the session-list snapshot.
    pub async fn touch(&self) {
        let mut inner = self.inner.write().await;
        inner.generation += 1;
        let _ = self.changed.send(inner.generation);
    }

    pub async fn snapshot(&self) -> StateFile {
        self.inner.read().await.state.clone()
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StateFile) -> std::result::Result<T, SchmuxError>,
    ) -> std::result::Result<T, SchmuxError> {
        let mut inner = self.inner.write().await;
        let out = f(&mut inner.state)?;
        inner.generation += 1;
        let _ = self.changed.send(inner.generation);
        Ok(out)
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub async fn list_workspaces(&self) -> Vec<Workspace> {
        self.inner.read().await.state.workspaces.clone()
    }

    pub async fn get_workspace(&self, id: &str) -> Option<Workspace> {
        self.inner
            .read()
            .await
            .state
            .workspaces
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    pub async fn find_workspace(&self, repo: &str, branch: &str) -> Option<Workspace> {
        self.inner
            .read()
            .await
            .state
            .workspaces
            .iter()
            .find(|w| w.repo == repo && w.branch == branch)
            .cloned()
    }

    pub async fn add_workspace(&self, workspace: Workspace) -> std::result::Result<(), SchmuxError> {
        self.mutate(|state| {
            if state.workspaces.iter().any(|w| w.id == workspace.id) {
                return Err(SchmuxError::Conflict(format!(
                    "workspace id {} already exists",
                    workspace.id
                )));
            }
            if state.workspaces.iter().any(|w| w.path == workspace.path) {
                return Err(SchmuxError::Conflict(format!(
                    "workspace path {} already exists",
                    workspace.path.display()
                )));
            }
            if let Some(host_id) = &workspace.remote_host_id {
                if !state.remote_hosts.iter().any(|h| &h.id == host_id) {
                    return Err(SchmuxError::Validation(format!(
                        "workspace references unknown remote host {host_id}"
                    )));
                }
            }
            state.workspaces.push(workspace);
            Ok(())
        })
        .await
    }

    pub async fn update_workspace(
        &self,
        id: &str,
        f: impl FnOnce(&mut Workspace),
    ) -> std::result::Result<Workspace, SchmuxError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let workspace = state
                .workspaces
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or_else(|| SchmuxError::NotFound(format!("workspace {id} not found")))?;
            f(workspace);
            Ok(workspace.clone())
        })
        .await
    }

    pub async fn remove_workspace(&self, id: &str) -> std::result::Result<(), SchmuxError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let before = state.workspaces.len();
            state.workspaces.retain(|w| w.id != id);
            if state.workspaces.len() == before {
                return Err(SchmuxError::NotFound(format!("workspace {id} not found")));
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.inner.read().await.state.sessions.clone()
    }

    pub async fn sessions_for_workspace(&self, workspace_id: &str) -> Vec<Session> {
        self.inner
            .read()
            .await
            .state
            .sessions
            .iter()
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .collect()
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .state
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// True if any live session already claims this multiplexer name.
    pub async fn tmux_name_in_use(&self, name: &str) -> bool {
        self.inner
            .read()
            .await
            .state
            .sessions
            .iter()
            .any(|s| s.tmux_session == name)
    }

    pub async fn add_session(&self, session: Session) -> std::result::Result<(), SchmuxError> {
        self.mutate(|state| {
            if state.sessions.iter().any(|s| s.id == session.id) {
                return Err(SchmuxError::Conflict(format!(
                    "session id {} already exists",
                    session.id
                )));
            }
            if state
                .sessions
                .iter()
                .any(|s| s.tmux_session == session.tmux_session)
            {
                return Err(SchmuxError::Conflict(format!(
                    "multiplexer session {} already exists",
                    session.tmux_session
                )));
            }
            if !state.workspaces.iter().any(|w| w.id == session.workspace_id) {
                return Err(SchmuxError::Validation(format!(
                    "session references unknown workspace {}",
                    session.workspace_id
                )));
            }
            state.sessions.push(session);
            Ok(())
        })
        .await
    }

    pub async fn update_session(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session),
    ) -> std::result::Result<Session, SchmuxError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let session = state
                .sessions
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| SchmuxError::NotFound(format!("session {id} not found")))?;
            f(session);
            Ok(session.clone())
        })
        .await
    }

    pub async fn remove_session(&self, id: &str) -> std::result::Result<(), SchmuxError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let before = state.sessions.len();
            state.sessions.retain(|s| s.id != id);
            if state.sessions.len() == before {
                return Err(SchmuxError::NotFound(format!("session {id} not found")));
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Remote hosts
    // =========================================================================

    pub async fn list_remote_hosts(&self) -> Vec<RemoteHost> {
        self.inner.read().await.state.remote_hosts.clone()
    }

    pub async fn get_remote_host(&self, id: &str) -> Option<RemoteHost> {
        self.inner
            .read()
            .await
            .state
            .remote_hosts
            .iter()
            .find(|h| h.id == id)
            .cloned()
    }

    /// At most one connected host per flavor is an invariant the remote
    /// manager relies on.
    pub async fn connected_host_for_flavor(&self, flavor_id: &str) -> Option<RemoteHost> {
        self.inner
            .read()
            .await
            .state
            .remote_hosts
            .iter()
            .find(|h| h.flavor_id == flavor_id && h.status.is_usable())
            .cloned()
    }

    pub async fn add_remote_host(&self, host: RemoteHost) -> std::result::Result<(), SchmuxError> {
        self.mutate(|state| {
            if state.remote_hosts.iter().any(|h| h.id == host.id) {
                return Err(SchmuxError::Conflict(format!(
                    "remote host {} already exists",
                    host.id
                )));
            }
            state.remote_hosts.push(host);
            Ok(())
        })
        .await
    }

    pub async fn update_remote_host(
        &self,
        id: &str,
        f: impl FnOnce(&mut RemoteHost),
    ) -> std::result::Result<RemoteHost, SchmuxError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let host = state
                .remote_hosts
                .iter_mut()
                .find(|h| h.id == id)
                .ok_or_else(|| SchmuxError::NotFound(format!("remote host {id} not found")))?;
            f(host);
            Ok(host.clone())
        })
        .await
    }

    pub async fn remove_remote_host(&self, id: &str) -> std::result::Result<(), SchmuxError> {
        let id = id.to_string();
        self.mutate(move |state| {
            let before = state.remote_hosts.len();
            state.remote_hosts.retain(|h| h.id != id);
            if state.remote_hosts.len() == before {
                return Err(SchmuxError::NotFound(format!("remote host {id} not found")));
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Pull requests
    // =========================================================================

    pub async fn list_pull_requests(&self) -> Vec<PullRequest> {
        self.inner.read().await.state.pull_requests.clone()
    }

    /// Replace the cache wholesale; the discovery helper owns its content.
    pub async fn set_pull_requests(&self, prs: Vec<PullRequest>) {
        let result: std::result::Result<(), SchmuxError> = self
            .mutate(|state| {
                state.pull_requests = prs;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!("failed to update PR cache: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GitStats, RemoteHostStatus, RenderMode};
    use chrono::Utc;

    fn workspace(id: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            repo: "git@example.com:me/proj.git".to_string(),
            branch: id.to_string(),
            path: PathBuf::from(format!("/tmp/ws/{id}")),
            remote_host_id: None,
            stats: GitStats::default(),
            ws_config: None,
        }
    }

    fn session(id: &str, workspace_id: &str) -> Session {
        Session {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            target: "shell".to_string(),
            nickname: None,
            prompt: None,
            tmux_session: format!("schmux-{workspace_id}-{id}"),
            pid: None,
            created_at: Utc::now(),
            last_output_at: None,
            nudge_state: None,
            nudge_summary: None,
            render_mode: RenderMode::Terminal,
            running: true,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::load(&dir.path().join("state.json")).unwrap()
    }

    #[tokio::test]
    async fn missing_file_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.list_workspaces().await.is_empty());
        assert!(store.list_sessions().await.is_empty());
    }

    #[test]
    fn corrupt_file_refuses_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"workspaces\": [oops").unwrap();
        assert!(StateStore::load(&path).is_err());
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).unwrap();

        store.add_workspace(workspace("ws-main")).await.unwrap();
        store.add_session(session("s1", "ws-main")).await.unwrap();
        store.save().await.unwrap();

        // No temp residue after a clean save.
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = StateStore::load(&path).unwrap();
        let state = reloaded.snapshot().await;
        assert_eq!(state.workspaces.len(), 1);
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions[0].tmux_session, "schmux-ws-main-s1");
    }

    #[tokio::test]
    async fn duplicate_workspace_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_workspace(workspace("ws-main")).await.unwrap();
        let mut dup = workspace("ws-main");
        dup.path = PathBuf::from("/tmp/elsewhere");
        assert!(matches!(
            store.add_workspace(dup).await,
            Err(SchmuxError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_workspace_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_workspace(workspace("ws-a")).await.unwrap();
        let mut dup = workspace("ws-b");
        dup.path = PathBuf::from("/tmp/ws/ws-a");
        assert!(store.add_workspace(dup).await.is_err());
    }

    #[tokio::test]
    async fn remote_workspace_requires_existing_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut remote_ws = workspace("ws-remote");
        remote_ws.remote_host_id = Some("ghost".to_string());
        assert!(matches!(
            store.add_workspace(remote_ws).await,
            Err(SchmuxError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn session_requires_existing_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(matches!(
            store.add_session(session("s1", "nowhere")).await,
            Err(SchmuxError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_tmux_session_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_workspace(workspace("ws-main")).await.unwrap();
        store.add_session(session("s1", "ws-main")).await.unwrap();
        let mut dup = session("s2", "ws-main");
        dup.tmux_session = "schmux-ws-main-s1".to_string();
        assert!(matches!(
            store.add_session(dup).await,
            Err(SchmuxError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn mutations_bump_generation_and_notify() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let mut rx = store.subscribe();
        assert_eq!(*rx.borrow(), 0);

        store.add_workspace(workspace("ws-main")).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        store
            .update_workspace("ws-main", |w| w.stats.dirty = true)
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[tokio::test]
    async fn failed_mutation_does_not_bump_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let generation = store.generation().await;
        let _ = store.remove_workspace("missing").await;
        assert_eq!(store.generation().await, generation);
    }

    #[tokio::test]
    async fn touch_bumps_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let before = store.generation().await;
        store.touch().await;
        assert_eq!(store.generation().await, before + 1);
    }

    #[tokio::test]
    async fn connected_host_lookup_honors_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .add_remote_host(RemoteHost {
                id: "h1".to_string(),
                flavor_id: "f1".to_string(),
                hostname: None,
                status: RemoteHostStatus::Provisioning,
                connected_at: None,
                expires_at: None,
                provisioning_session_id: None,
            })
            .await
            .unwrap();
        assert!(store.connected_host_for_flavor("f1").await.is_none());

        store
            .update_remote_host("h1", |h| h.status = RemoteHostStatus::Connected)
            .await
            .unwrap();
        assert!(store.connected_host_for_flavor("f1").await.is_some());
    }

    #[tokio::test]
    async fn remove_session_is_not_idempotent_at_store_level() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.add_workspace(workspace("ws-main")).await.unwrap();
        store.add_session(session("s1", "ws-main")).await.unwrap();
        store.remove_session("s1").await.unwrap();
        assert!(matches!(
            store.remove_session("s1").await,
            Err(SchmuxError::NotFound(_))
        ));
    }
}
