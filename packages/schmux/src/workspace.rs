use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SchmuxError};
use crate::git::types::{DiffFile, GraphNode, ScanDelta, ScanUpdate};
use crate::git::{diff, graph, status, worktree};
use crate::models::{GitStats, Workspace, WorkspaceConfig};
use crate::state::StateStore;

/// Cached git stats are considered fresh for this long unless a refresh is
/// forced (sync completion, output burst, explicit refresh).
const STATUS_TTL: Duration = Duration::from_secs(5);

/// Creates and removes on-disk working copies, computes git-derived status,
/// and reconciles the workspace root with the store.
pub struct WorkspaceManager {
    store: Arc<StateStore>,
    root: PathBuf,
    status_cache: Mutex<HashMap<String, (Instant, GitStats)>>,
}

/// A working copy discovered on disk by the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundCopy {
    pub id: String,
    pub repo: String,
    pub branch: String,
    pub path: PathBuf,
}

impl WorkspaceManager {
    pub fn new(store: Arc<StateStore>, root: PathBuf) -> Self {
        Self {
            store,
            root,
            status_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get or create the workspace for `(repo, branch)`. Idempotent; on any
    /// failure after the directory was created, the partial directory is
    /// cleaned up.
    pub async fn ensure(&self, repo: &str, branch: &str) -> Result<Workspace> {
        if let Some(existing) = self.store.find_workspace(repo, branch).await {
            return Ok(existing);
        }

        let existing_ids: Vec<String> = self
            .store
            .list_workspaces()
            .await
            .into_iter()
            .map(|w| w.id)
            .collect();
        let id = allocate_id(branch, &existing_ids);
        let path = self.root.join(&id);

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SchmuxError::Fatal(format!("creating workspace root: {e}")))?;

        let sibling = self.sibling_for(repo).await;
        info!("creating workspace {id} for {repo}@{branch}");
        if let Err(e) =
            worktree::create_working_copy(repo, branch, &path, sibling.as_deref()).await
        {
            // Never leave a half-created working copy behind.
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(SchmuxError::Transient(format!(
                "creating working copy for {repo}@{branch}: {e}"
            )));
        }

        let workspace = Workspace {
            id: id.clone(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.clone(),
            remote_host_id: None,
            stats: GitStats::default(),
            ws_config: load_ws_config(&path).await,
        };
        if let Err(e) = self.store.add_workspace(workspace.clone()).await {
            let _ = worktree::remove_working_copy(&path).await;
            return Err(e);
        }
        Ok(workspace)
    }

    /// An existing local working copy of the same repo, used as the worktree
    /// parent.
    async fn sibling_for(&self, repo: &str) -> Option<PathBuf> {
        self.store
            .list_workspaces()
            .await
            .into_iter()
            .find(|w| w.repo == repo && w.remote_host_id.is_none())
            .map(|w| w.path)
    }

    /// Walk the workspace root and reconcile with the store. Read-only
    /// toward git and idempotent; never deletes on-disk data.
    pub async fn scan(&self) -> Result<ScanDelta> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.apply_scan(Vec::new()).await;
            }
            Err(e) => {
                return Err(SchmuxError::Fatal(format!(
                    "reading workspace root {}: {e}",
                    self.root.display()
                )));
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some((repo, branch)) = worktree::identify(&path).await else {
                debug!("scan: {} is not a working copy, skipping", path.display());
                continue;
            };
            let id = entry.file_name().to_string_lossy().to_string();
            found.push(FoundCopy {
                id,
                repo,
                branch,
                path,
            });
        }
        self.apply_scan(found).await
    }

    async fn apply_scan(&self, found: Vec<FoundCopy>) -> Result<ScanDelta> {
        // Remote workspaces live on their host, not under the local root.
        let known: Vec<Workspace> = self
            .store
            .list_workspaces()
            .await
            .into_iter()
            .filter(|w| w.remote_host_id.is_none())
            .collect();
        let mut delta = diff_scan(&found, &known);

        for workspace in &mut delta.added {
            workspace.ws_config = load_ws_config(&workspace.path).await;
            self.store.add_workspace(workspace.clone()).await?;
        }
        for update in &delta.updated {
            self.store
                .update_workspace(&update.new.id, |w| {
                    w.repo = update.new.repo.clone();
                    w.branch = update.new.branch.clone();
                })
                .await?;
        }
        for workspace in &delta.removed {
            // The path is gone; drop the record and any contained sessions.
            for session in self.store.sessions_for_workspace(&workspace.id).await {
                let _ = self.store.remove_session(&session.id).await;
            }
            self.store.remove_workspace(&workspace.id).await?;
        }

        Ok(delta)
    }

    /// Compute (or serve cached) git stats and store them on the workspace.
    pub async fn git_status(&self, workspace_id: &str, force: bool) -> Result<GitStats> {
        let workspace = self.get(workspace_id).await?;

        {
            let cache = self.status_cache.lock().await;
            if !force {
                if let Some((at, stats)) = cache.get(workspace_id) {
                    if at.elapsed() < STATUS_TTL {
                        return Ok(stats.clone());
                    }
                }
            }
        }

        let stats = status::compute_stats(&workspace.path)
            .await
            .map_err(SchmuxError::Transient)?;

        self.status_cache
            .lock()
            .await
            .insert(workspace_id.to_string(), (Instant::now(), stats.clone()));
        self.store
            .update_workspace(workspace_id, |w| w.stats = stats.clone())
            .await?;
        Ok(stats)
    }

    pub async fn git_graph(&self, workspace_id: &str) -> Result<Vec<GraphNode>> {
        let workspace = self.get(workspace_id).await?;
        graph::graph(&workspace.path)
            .await
            .map_err(SchmuxError::Transient)
    }

    pub async fn diff(&self, workspace_id: &str) -> Result<Vec<DiffFile>> {
        let workspace = self.get(workspace_id).await?;
        diff::working_tree_diff(&workspace.path)
            .await
            .map_err(SchmuxError::Transient)
    }

    /// Remove the working copy and the record. The session supervisor has
    /// already disposed contained sessions by the time this runs.
    pub async fn dispose(&self, workspace_id: &str) -> Result<()> {
        let workspace = self.get(workspace_id).await?;
        if workspace.remote_host_id.is_none() {
            if let Err(e) = worktree::remove_working_copy(&workspace.path).await {
                warn!("removing working copy {}: {e}", workspace.path.display());
            }
        }
        self.status_cache.lock().await.remove(workspace_id);
        self.store.remove_workspace(workspace_id).await
    }

    pub async fn get(&self, workspace_id: &str) -> Result<Workspace> {
        self.store
            .get_workspace(workspace_id)
            .await
            .ok_or_else(|| SchmuxError::NotFound(format!("workspace {workspace_id} not found")))
    }
}

/// Derive a filesystem- and URL-safe workspace id from a branch name,
/// suffixing `-2`, `-3`, ... on collision.
pub fn allocate_id(branch: &str, existing: &[String]) -> String {
    let base = slugify(branch);
    if !existing.iter().any(|id| id == &base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.iter().any(|id| id == &candidate) {
            return candidate;
        }
        n += 1;
    }
}

pub fn slugify(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    let mut last_dash = false;
    for c in branch.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "workspace".to_string()
    } else {
        trimmed
    }
}

/// Pure reconciliation: compare what the scan found with what the store
/// knows. Matching is by workspace id (the directory name).
pub fn diff_scan(found: &[FoundCopy], known: &[Workspace]) -> ScanDelta {
    let mut delta = ScanDelta::default();

    for copy in found {
        match known.iter().find(|w| w.id == copy.id) {
            None => delta.added.push(Workspace {
                id: copy.id.clone(),
                repo: copy.repo.clone(),
                branch: copy.branch.clone(),
                path: copy.path.clone(),
                remote_host_id: None,
                stats: GitStats::default(),
                ws_config: None,
            }),
            Some(existing) => {
                if existing.repo != copy.repo || existing.branch != copy.branch {
                    let mut new = existing.clone();
                    new.repo = copy.repo.clone();
                    new.branch = copy.branch.clone();
                    delta.updated.push(ScanUpdate {
                        old: existing.clone(),
                        new,
                    });
                }
            }
        }
    }

    for workspace in known {
        if !found.iter().any(|c| c.id == workspace.id) {
            delta.removed.push(workspace.clone());
        }
    }

    delta
}

/// Workspace-scoped configuration discovered inside the working copy.
pub async fn load_ws_config(path: &Path) -> Option<WorkspaceConfig> {
    let text = tokio::fs::read_to_string(path.join(".schmux/config.json"))
        .await
        .ok()?;
    match serde_json::from_str(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(".schmux/config.json in {} is invalid: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(id: &str, repo: &str, branch: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: PathBuf::from(format!("/ws/{id}")),
            remote_host_id: None,
            stats: GitStats::default(),
            ws_config: None,
        }
    }

    fn found(id: &str, repo: &str, branch: &str) -> FoundCopy {
        FoundCopy {
            id: id.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: PathBuf::from(format!("/ws/{id}")),
        }
    }

    #[test]
    fn slugify_replaces_separators() {
        assert_eq!(slugify("feature/login-flow"), "feature-login-flow");
        assert_eq!(slugify("fix/issue#42"), "fix-issue-42");
        assert_eq!(slugify("v1.2.3"), "v1.2.3");
        assert_eq!(slugify("///"), "workspace");
    }

    #[test]
    fn allocate_id_suffixes_on_collision() {
        let existing = vec!["main".to_string(), "main-2".to_string()];
        assert_eq!(allocate_id("main", &existing), "main-3");
        assert_eq!(allocate_id("other", &existing), "other");
    }

    #[test]
    fn diff_scan_empty_both_sides() {
        let delta = diff_scan(&[], &[]);
        assert!(delta.is_empty());
    }

    #[test]
    fn diff_scan_detects_added() {
        let delta = diff_scan(&[found("ws-new", "R", "main")], &[]);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].id, "ws-new");
        assert_eq!(delta.added[0].repo, "R");
        assert_eq!(delta.added[0].branch, "main");
        assert!(delta.updated.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn diff_scan_detects_removed() {
        let delta = diff_scan(&[], &[workspace("gone", "R", "main")]);
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].id, "gone");
    }

    #[test]
    fn diff_scan_detects_changed_branch() {
        let delta = diff_scan(
            &[found("ws", "R", "feature")],
            &[workspace("ws", "R", "main")],
        );
        assert_eq!(delta.updated.len(), 1);
        assert_eq!(delta.updated[0].old.branch, "main");
        assert_eq!(delta.updated[0].new.branch, "feature");
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn diff_scan_unchanged_is_empty() {
        let delta = diff_scan(
            &[found("ws", "R", "main")],
            &[workspace("ws", "R", "main")],
        );
        assert!(delta.is_empty());
    }

    #[test]
    fn diff_scan_second_run_is_empty() {
        // Scan soundness: applying the delta then rescanning yields nothing.
        let on_disk = vec![found("a", "R", "main"), found("b", "R", "dev")];
        let first = diff_scan(&on_disk, &[]);
        assert_eq!(first.added.len(), 2);
        let second = diff_scan(&on_disk, &first.added);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn load_ws_config_absent_or_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_ws_config(dir.path()).await.is_none());

        std::fs::create_dir_all(dir.path().join(".schmux")).unwrap();
        std::fs::write(dir.path().join(".schmux/config.json"), "nope").unwrap();
        assert!(load_ws_config(dir.path()).await.is_none());

        std::fs::write(
            dir.path().join(".schmux/config.json"),
            r#"{"quick_launch": [{"name": "t", "target": "shell"}], "branch_url_template": "https://x/{branch}"}"#,
        )
        .unwrap();
        let config = load_ws_config(dir.path()).await.unwrap();
        assert_eq!(config.quick_launch.len(), 1);
        assert_eq!(
            config.branch_url_template.as_deref(),
            Some("https://x/{branch}")
        );
    }
}
