use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ResolverConfig;
use crate::error::{Result, SchmuxError};
use crate::git::rebase::{self, RebaseOutcome};
use crate::models::{
    ConflictResolution, StepStatus, SyncAction, SyncState, SyncStatus, SyncStep, Workspace,
};
use crate::state::StateStore;
use crate::workspace::WorkspaceManager;

/// Safety bound on conflict rounds within one sync; a rebase that keeps
/// stopping past this is handed back for manual resolution.
const MAX_CONFLICT_ROUNDS: u32 = 20;

// =============================================================================
// Git seam
// =============================================================================

/// The git operations the sync FSM drives, behind a seam so the state
/// machine is testable without a repository.
pub trait SyncGit: Send + Sync + 'static {
    fn fetch(&self, dir: &Path) -> impl Future<Output = std::result::Result<(), String>> + Send;
    fn rebase_upstream(
        &self,
        dir: &Path,
    ) -> impl Future<Output = std::result::Result<RebaseOutcome, String>> + Send;
    fn rebase_continue(
        &self,
        dir: &Path,
    ) -> impl Future<Output = std::result::Result<RebaseOutcome, String>> + Send;
    fn conflict_sides(
        &self,
        dir: &Path,
        file: &str,
    ) -> impl Future<Output = std::result::Result<rebase::ConflictSides, String>> + Send;
    fn write_file(
        &self,
        dir: &Path,
        file: &str,
        content: &str,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;
    fn stage_files(
        &self,
        dir: &Path,
        files: &[String],
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;
    fn head_hash(&self, dir: &Path)
    -> impl Future<Output = std::result::Result<String, String>> + Send;
}

/// Production implementation shelling out to git.
#[derive(Clone)]
pub struct RealSyncGit {
    pub fetch_timeout: Duration,
}

impl SyncGit for RealSyncGit {
    async fn fetch(&self, dir: &Path) -> std::result::Result<(), String> {
        rebase::fetch(dir, self.fetch_timeout).await
    }

    async fn rebase_upstream(&self, dir: &Path) -> std::result::Result<RebaseOutcome, String> {
        rebase::rebase_upstream(dir).await
    }

    async fn rebase_continue(&self, dir: &Path) -> std::result::Result<RebaseOutcome, String> {
        rebase::rebase_continue(dir).await
    }

    async fn conflict_sides(
        &self,
        dir: &Path,
        file: &str,
    ) -> std::result::Result<rebase::ConflictSides, String> {
        rebase::conflict_sides(dir, file).await
    }

    async fn write_file(
        &self,
        dir: &Path,
        file: &str,
        content: &str,
    ) -> std::result::Result<(), String> {
        tokio::fs::write(dir.join(file), content)
            .await
            .map_err(|e| format!("writing {file}: {e}"))
    }

    async fn stage_files(&self, dir: &Path, files: &[String]) -> std::result::Result<(), String> {
        rebase::stage_files(dir, files).await
    }

    async fn head_hash(&self, dir: &Path) -> std::result::Result<String, String> {
        rebase::head_hash(dir).await
    }
}

// =============================================================================
// Resolver seam
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConflictFile {
    pub path: String,
    pub upstream: String,
    pub local: String,
    pub merged: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FileResolution {
    pub path: String,
    pub content: String,
    pub confidence: f64,
    pub summary: String,
}

/// The external helper asked to propose conflict resolutions.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(
        &self,
        local_commit: Option<&str>,
        files: &[ConflictFile],
    ) -> impl Future<Output = std::result::Result<Vec<FileResolution>, String>> + Send;
}

/// HTTP resolver speaking an Anthropic-style messages API.
#[derive(Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    config: ResolverConfig,
}

impl HttpResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl Resolver for HttpResolver {
    async fn resolve(
        &self,
        local_commit: Option<&str>,
        files: &[ConflictFile],
    ) -> std::result::Result<Vec<FileResolution>, String> {
        let prompt = build_resolver_prompt(local_commit, files);
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": 16384,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("resolver request failed: {e}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("resolver returned {status}: {text}"));
        }
        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("resolver reply not JSON: {e}"))?;
        parse_resolver_reply(&reply)
    }
}

/// The helper replies with a messages-API envelope whose first text block is
/// a JSON document: `{"resolutions": [{path, content, confidence, summary}]}`.
pub fn parse_resolver_reply(
    reply: &serde_json::Value,
) -> std::result::Result<Vec<FileResolution>, String> {
    let text = reply["content"]
        .as_array()
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b["type"] == "text")
                .and_then(|b| b["text"].as_str())
        })
        .ok_or_else(|| "resolver reply has no text block".to_string())?;

    // Tolerate a fenced code block around the JSON.
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    #[derive(Deserialize)]
    struct Wrapper {
        resolutions: Vec<FileResolution>,
    }
    let wrapper: Wrapper = serde_json::from_str(trimmed)
        .map_err(|e| format!("resolver reply is not valid resolution JSON: {e}"))?;
    Ok(wrapper.resolutions)
}

pub fn build_resolver_prompt(local_commit: Option<&str>, files: &[ConflictFile]) -> String {
    let mut prompt = String::from(
        "You are resolving git rebase conflicts. For each file below, produce the \
         fully merged content, preserving the intent of both sides.\n\
         Reply with JSON only: {\"resolutions\": [{\"path\", \"content\", \
         \"confidence\" (0..1), \"summary\"}]}.\n\n",
    );
    if let Some(commit) = local_commit {
        prompt.push_str(&format!("Local commit being replayed: {commit}\n\n"));
    }
    for file in files {
        prompt.push_str(&format!(
            "=== {path} ===\n--- upstream side ---\n{upstream}\n--- local side ---\n{local}\n\
             --- conflicted working tree ---\n{merged}\n\n",
            path = file.path,
            upstream = file.upstream,
            local = file.local,
            merged = file.merged,
        ));
    }
    prompt
}

// =============================================================================
// The FSM
// =============================================================================

/// Runs the fetch + rebase loop for one workspace at a time, recording every
/// transition as a step in the per-workspace trace.
pub struct LinearSync<G: SyncGit, R: Resolver> {
    store: Arc<StateStore>,
    workspaces: Arc<WorkspaceManager>,
    git: G,
    resolver: Option<R>,
    confidence_floor: f64,
    states: Mutex<HashMap<String, SyncState>>,
}

impl<G: SyncGit, R: Resolver> LinearSync<G, R> {
    pub fn new(
        store: Arc<StateStore>,
        workspaces: Arc<WorkspaceManager>,
        git: G,
        resolver: Option<R>,
        confidence_floor: f64,
    ) -> Self {
        Self {
            store,
            workspaces,
            git,
            resolver,
            confidence_floor,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Kick off a sync for the workspace. Rejects with `Conflict` while a
    /// previous attempt is still in progress; a retained terminal trace is
    /// replaced.
    pub async fn start(self: &Arc<Self>, workspace: Workspace) -> Result<()> {
        {
            let mut states = self.states.lock().await;
            if let Some(existing) = states.get(&workspace.id) {
                if existing.status == SyncStatus::InProgress {
                    return Err(SchmuxError::Conflict(format!(
                        "sync already running for workspace {}",
                        workspace.id
                    )));
                }
            }
            states.insert(workspace.id.clone(), SyncState::new(&workspace.id));
        }
        self.store.touch().await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(workspace).await;
        });
        Ok(())
    }

    pub async fn get_state(&self, workspace_id: &str) -> Option<SyncState> {
        self.states.lock().await.get(workspace_id).cloned()
    }

    pub async fn all_states(&self) -> Vec<SyncState> {
        self.states.lock().await.values().cloned().collect()
    }

    /// Drop a retained terminal trace. In-progress attempts cannot be
    /// dismissed.
    pub async fn dismiss(&self, workspace_id: &str) -> Result<()> {
        let mut states = self.states.lock().await;
        match states.get(workspace_id) {
            None => Ok(()),
            Some(state) if state.status == SyncStatus::InProgress => Err(SchmuxError::Conflict(
                format!("sync for {workspace_id} is still running"),
            )),
            Some(_) => {
                states.remove(workspace_id);
                drop(states);
                self.store.touch().await;
                Ok(())
            }
        }
    }

    async fn push_step(&self, workspace_id: &str, step: SyncStep) {
        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(workspace_id) {
                state.steps.push(step);
            }
        }
        self.store.touch().await;
    }

    async fn finish(&self, workspace_id: &str, status: SyncStatus, hash: Option<String>) {
        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(workspace_id) {
                state.status = status;
                state.hash = hash;
                state.finished_at = Some(Utc::now());
            }
        }
        self.store.touch().await;
        // Stats changed under the workspace; best-effort refresh.
        let _ = self.workspaces.git_status(workspace_id, true).await;
    }

    async fn fail(&self, workspace_id: &str, action: SyncAction, message: String) {
        warn!("sync {workspace_id}: {action:?} failed: {message}");
        self.push_step(
            workspace_id,
            SyncStep {
                action,
                status: StepStatus::Failed,
                message,
                timestamp: Utc::now(),
                local_commit: None,
                files: None,
                confidence: None,
                summary: None,
            },
        )
        .await;
        self.finish(workspace_id, SyncStatus::Failed, None).await;
    }

    fn ok_step(action: SyncAction, message: impl Into<String>) -> SyncStep {
        SyncStep {
            action,
            status: StepStatus::Ok,
            message: message.into(),
            timestamp: Utc::now(),
            local_commit: None,
            files: None,
            confidence: None,
            summary: None,
        }
    }

    async fn run(self: Arc<Self>, workspace: Workspace) {
        let id = workspace.id.clone();
        let dir: PathBuf = workspace.path.clone();
        info!("sync {id}: starting");

        if let Err(e) = self.git.fetch(&dir).await {
            self.fail(&id, SyncAction::Fetch, e).await;
            return;
        }
        self.push_step(&id, Self::ok_step(SyncAction::Fetch, "fetched upstream"))
            .await;

        let mut outcome = match self.git.rebase_upstream(&dir).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail(&id, SyncAction::Rebase, e).await;
                return;
            }
        };
        self.push_step(&id, Self::ok_step(SyncAction::Rebase, "rebase started"))
            .await;

        let mut rounds = 0u32;
        loop {
            match outcome {
                RebaseOutcome::Clean => {
                    let hash = self.git.head_hash(&dir).await.ok();
                    self.push_step(&id, Self::ok_step(SyncAction::Done, "rebase complete"))
                        .await;
                    self.finish(&id, SyncStatus::Done, hash).await;
                    info!("sync {id}: clean");
                    return;
                }
                RebaseOutcome::Conflict {
                    files,
                    local_commit,
                } => {
                    rounds += 1;
                    if rounds > MAX_CONFLICT_ROUNDS {
                        self.fail(
                            &id,
                            SyncAction::Conflict,
                            format!("gave up after {MAX_CONFLICT_ROUNDS} conflict rounds"),
                        )
                        .await;
                        return;
                    }

                    let mut step = Self::ok_step(
                        SyncAction::Conflict,
                        format!("rebase stopped on {} file(s)", files.len()),
                    );
                    step.files = Some(files.clone());
                    step.local_commit = local_commit.clone();
                    self.push_step(&id, step).await;

                    if self.resolver.is_none() {
                        // The working copy is left in the git-native conflict
                        // state for manual resolution.
                        self.fail(
                            &id,
                            SyncAction::AskHelper,
                            "no conflict resolver configured".to_string(),
                        )
                        .await;
                        return;
                    }

                    let mut conflict_files = Vec::with_capacity(files.len());
                    for file in &files {
                        match self.git.conflict_sides(&dir, file).await {
                            Ok(sides) => conflict_files.push(ConflictFile {
                                path: file.clone(),
                                upstream: sides.upstream,
                                local: sides.local,
                                merged: sides.merged,
                            }),
                            Err(e) => {
                                self.fail(&id, SyncAction::AskHelper, e).await;
                                return;
                            }
                        }
                    }

                    let resolver = self.resolver.as_ref().unwrap();
                    let resolutions = match resolver
                        .resolve(local_commit.as_deref(), &conflict_files)
                        .await
                    {
                        Ok(resolutions) => resolutions,
                        Err(e) => {
                            // Preserve the helper's error verbatim.
                            self.fail(&id, SyncAction::AskHelper, e).await;
                            return;
                        }
                    };

                    if let Err(e) = validate_resolutions(&files, &resolutions, self.confidence_floor)
                    {
                        self.fail(&id, SyncAction::AskHelper, e).await;
                        return;
                    }
                    let min_confidence = resolutions
                        .iter()
                        .map(|r| r.confidence)
                        .fold(f64::INFINITY, f64::min);
                    let mut step =
                        Self::ok_step(SyncAction::AskHelper, "helper proposed resolutions");
                    step.confidence = Some(min_confidence);
                    self.push_step(&id, step).await;

                    for resolution in &resolutions {
                        if let Err(e) = self
                            .git
                            .write_file(&dir, &resolution.path, &resolution.content)
                            .await
                        {
                            self.fail(&id, SyncAction::Apply, e).await;
                            return;
                        }
                    }
                    {
                        let mut states = self.states.lock().await;
                        if let Some(state) = states.get_mut(&id) {
                            state
                                .resolutions
                                .extend(resolutions.iter().map(|r| ConflictResolution {
                                    file: r.path.clone(),
                                    confidence: r.confidence,
                                    summary: r.summary.clone(),
                                }));
                        }
                    }
                    if let Err(e) = self.git.stage_files(&dir, &files).await {
                        self.fail(&id, SyncAction::Apply, e).await;
                        return;
                    }
                    self.push_step(
                        &id,
                        Self::ok_step(SyncAction::Apply, "resolutions written and staged"),
                    )
                    .await;

                    outcome = match self.git.rebase_continue(&dir).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            self.fail(&id, SyncAction::Continue, e).await;
                            return;
                        }
                    };
                    self.push_step(
                        &id,
                        Self::ok_step(SyncAction::Continue, "rebase continued"),
                    )
                    .await;
                }
            }
        }
    }
}

/// Every conflicted file must be covered and meet the confidence floor, and
/// the helper must not name any file outside the conflicted set. The reply
/// is an untrusted HTTP payload; nothing it names is written until it passes
/// here.
pub fn validate_resolutions(
    files: &[String],
    resolutions: &[FileResolution],
    floor: f64,
) -> std::result::Result<(), String> {
    for resolution in resolutions {
        if !is_safe_repo_path(&resolution.path) {
            return Err(format!(
                "helper proposed an unsafe path: {}",
                resolution.path
            ));
        }
        if !files.iter().any(|f| f == &resolution.path) {
            return Err(format!(
                "helper proposed a resolution for {}, which is not a conflicted file",
                resolution.path
            ));
        }
    }
    for file in files {
        let resolution = resolutions
            .iter()
            .find(|r| &r.path == file)
            .ok_or_else(|| format!("helper offered no resolution for {file}"))?;
        if resolution.confidence < floor {
            return Err(format!(
                "helper confidence {:.2} for {} is below floor {:.2}",
                resolution.confidence, file, floor
            ));
        }
    }
    Ok(())
}

/// Repo-relative with no `..` or absolute components; everything else stays
/// off the filesystem.
fn is_safe_repo_path(path: &str) -> bool {
    let path = std::path::Path::new(path);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}
