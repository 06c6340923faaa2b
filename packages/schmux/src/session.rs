use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::config::{Config, DataDirs, RunTarget, TargetKind};
use crate::error::{Result, SchmuxError};
use crate::models::{RenderMode, Session};
use crate::state::StateStore;
use crate::streamjson::{StreamJsonHub, StreamJsonRegistry};
use crate::tmux::TmuxGateway;
use crate::tracker::{StreamTracker, TrackerEvent, TrackerRegistry};
use crate::workspace::{WorkspaceManager, slugify};

/// Output bursts trigger a workspace status refresh at most this often.
const STATUS_REFRESH_DEBOUNCE: Duration = Duration::from_secs(10);

/// `last_output_at` writes are damped to this cadence to keep chunk storms
/// from hammering the store.
const OUTPUT_STAMP_DEBOUNCE: Duration = Duration::from_secs(1);

/// How a spawn names its launch recipe: a configured target or an ad-hoc
/// command supplied inline.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    Named(String),
    Adhoc(String),
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub repo: String,
    pub branch: String,
    pub target: TargetSpec,
    pub prompt: Option<String>,
    pub nickname: Option<String>,
    pub workspace_id: Option<String>,
}

/// Owns the whole session lifecycle plus the tracker and stream-json
/// registries.
pub struct SessionSupervisor {
    store: Arc<StateStore>,
    workspaces: Arc<WorkspaceManager>,
    tmux: TmuxGateway,
    config: Arc<RwLock<Config>>,
    dirs: DataDirs,
    trackers: TrackerRegistry,
    hubs: StreamJsonRegistry,
    events_tx: mpsc::UnboundedSender<TrackerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TrackerEvent>>>,
    liveness: Mutex<HashMap<String, (Instant, bool)>>,
    status_refreshed: Mutex<HashMap<String, Instant>>,
    output_stamped: Mutex<HashMap<String, Instant>>,
}

impl SessionSupervisor {
    pub fn new(
        store: Arc<StateStore>,
        workspaces: Arc<WorkspaceManager>,
        tmux: TmuxGateway,
        config: Arc<RwLock<Config>>,
        dirs: DataDirs,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            workspaces,
            tmux,
            config,
            dirs,
            trackers: TrackerRegistry::new(),
            hubs: StreamJsonRegistry::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            liveness: Mutex::new(HashMap::new()),
            status_refreshed: Mutex::new(HashMap::new()),
            output_stamped: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self, session_id: &str) -> Option<StreamTracker> {
        self.trackers.get(session_id)
    }

    pub fn hub(&self, session_id: &str) -> Option<Arc<StreamJsonHub>> {
        self.hubs.get(session_id)
    }

    pub fn tmux(&self) -> &TmuxGateway {
        &self.tmux
    }

    /// Register a provisioning tracker (remote-host connect shells) under a
    /// session id the broadcast plane can bridge.
    pub fn register_provision_tracker(&self, session_id: &str, tracker: StreamTracker) {
        self.trackers.insert(session_id, tracker);
    }

    pub fn tracker_events(&self) -> mpsc::UnboundedSender<TrackerEvent> {
        self.events_tx.clone()
    }

    // =========================================================================
    // Spawn
    // =========================================================================

    pub async fn spawn(&self, request: SpawnRequest) -> Result<Session> {
        let target = self.resolve_target(&request).await?;
        validate_prompt(&target, request.prompt.as_deref())?;

        let workspace = match &request.workspace_id {
            Some(id) => self.workspaces.get(id).await?,
            None => self.workspaces.ensure(&request.repo, &request.branch).await?,
        };

        let session_id = new_session_id();
        let tmux_name = self.unique_tmux_name(&workspace.id).await;

        let prompt_file = match (&target.kind, &request.prompt) {
            (TargetKind::Promptable, Some(prompt)) => {
                let path = self.dirs.prompt_path(&session_id);
                tokio::fs::write(&path, prompt)
                    .await
                    .map_err(|e| SchmuxError::Fatal(format!("writing prompt file: {e}")))?;
                Some(path)
            }
            _ => None,
        };

        let command = build_command(
            &target,
            prompt_file.as_deref().map(|p| p.to_string_lossy().into_owned()),
            request.prompt.as_deref(),
        );

        let env = vec![("SCHMUX_SESSION_ID".to_string(), session_id.clone())];
        self.tmux
            .new_session(&tmux_name, &workspace.path.to_string_lossy(), &command, &env)
            .await?;

        // From here on, any failure must kill the multiplexer session rather
        // than leak it.
        match self
            .finish_spawn(&request, &target, &workspace.id, &session_id, &tmux_name)
            .await
        {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(kill_err) = self.tmux.kill_session(&tmux_name).await {
                    warn!("cleaning up failed spawn {tmux_name}: {kill_err}");
                }
                let _ = self.store.remove_session(&session_id).await;
                Err(e)
            }
        }
    }

    async fn finish_spawn(
        &self,
        request: &SpawnRequest,
        target: &RunTarget,
        workspace_id: &str,
        session_id: &str,
        tmux_name: &str,
    ) -> Result<Session> {
        // The pane should die with the agent so liveness tracking sees it.
        if let Err(e) = self.tmux.set_option(tmux_name, "remain-on-exit", "off").await {
            debug!("setting remain-on-exit on {tmux_name}: {e}");
        }

        let log_path = self.dirs.session_log_path(session_id);
        self.tmux
            .start_pipe(tmux_name, &log_path.to_string_lossy())
            .await?;

        // Targets without a template placeholder take the prompt over stdin,
        // typed in once the agent has had a moment to start reading.
        if target.prompt_via_stdin() {
            if let Some(prompt) = request.prompt.clone() {
                let tmux = self.tmux.clone();
                let name = tmux_name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    if let Err(e) = tmux.send_keys(&name, &format!("{prompt}\r")).await {
                        warn!("injecting prompt into {name}: {e}");
                    }
                });
            }
        }

        let pid = self.tmux.pane_pid(tmux_name).await.unwrap_or(None);
        let render_mode = if target.stream_json {
            RenderMode::Html
        } else {
            RenderMode::Terminal
        };

        let session = Session {
            id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            target: target.name.clone(),
            nickname: request.nickname.clone(),
            prompt: request.prompt.clone(),
            tmux_session: tmux_name.to_string(),
            pid,
            created_at: Utc::now(),
            last_output_at: None,
            nudge_state: None,
            nudge_summary: None,
            render_mode,
            running: true,
        };
        self.store.add_session(session.clone()).await?;

        let terminal = self.config.read().await.terminal.clone();
        let tracker = StreamTracker::new(
            session_id.to_string(),
            tmux_name.to_string(),
            self.tmux.clone(),
            terminal
                .filtered_sequences
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            log_path,
            terminal.max_log_size,
            terminal.rotated_log_size,
            self.events_tx.clone(),
        );
        self.trackers.insert(session_id, tracker.clone());

        if render_mode == RenderMode::Html {
            let hub = Arc::new(StreamJsonHub::new(session_id));
            self.hubs.insert(session_id, Arc::clone(&hub));
            let (_sub, mut rx) = tracker.subscribe();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    hub.feed(&chunk).await;
                }
            });
        }

        info!("spawned session {session_id} ({tmux_name}) in workspace {workspace_id}");
        Ok(session)
    }

    async fn resolve_target(&self, request: &SpawnRequest) -> Result<RunTarget> {
        match &request.target {
            TargetSpec::Named(name) => self
                .config
                .read()
                .await
                .target(name)
                .cloned()
                .ok_or_else(|| SchmuxError::Validation(format!("unknown run target: {name}"))),
            TargetSpec::Adhoc(command) => {
                if command.trim().is_empty() {
                    return Err(SchmuxError::Validation("empty command".into()));
                }
                Ok(RunTarget::adhoc(command))
            }
        }
    }

    async fn unique_tmux_name(&self, workspace_id: &str) -> String {
        let mut n = 1;
        loop {
            let candidate = format!("schmux-{workspace_id}-{n}");
            if !self.store.tmux_name_in_use(&candidate).await {
                return candidate;
            }
            n += 1;
        }
    }

    // =========================================================================
    // Dispose / rename / liveness
    // =========================================================================

    /// Idempotent: disposing an unknown session succeeds. The record removal
    /// is the contract; the multiplexer kill is best-effort.
    pub async fn dispose(&self, session_id: &str) -> Result<()> {
        let Some(session) = self.store.get_session(session_id).await else {
            return Ok(());
        };

        if let Some(tracker) = self.trackers.remove(session_id) {
            tracker.stop().await;
        }
        self.hubs.remove(session_id);

        if let Err(e) = self.tmux.kill_session(&session.tmux_session).await {
            debug!("killing {}: {e}", session.tmux_session);
        }
        let _ = tokio::fs::remove_file(self.dirs.prompt_path(session_id)).await;
        self.liveness.lock().await.remove(session_id);

        match self.store.remove_session(session_id).await {
            Ok(()) => Ok(()),
            Err(SchmuxError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Dispose every session in the workspace (concurrently, collecting
    /// errors), then remove the working copy and the record.
    pub async fn dispose_workspace(&self, workspace_id: &str) -> Result<()> {
        // Existence check up front so an unknown id is NotFound, not a no-op.
        self.workspaces.get(workspace_id).await?;

        let sessions = self.store.sessions_for_workspace(workspace_id).await;
        let disposals = sessions.iter().map(|s| self.dispose(&s.id));
        let errors: Vec<SchmuxError> = futures::future::join_all(disposals)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();
        if let Some(first) = errors.first() {
            return Err(SchmuxError::Fatal(format!(
                "failed to dispose {} session(s): {first}",
                errors.len()
            )));
        }

        self.workspaces.dispose(workspace_id).await
    }

    /// Update the nickname and rename the multiplexer session to match.
    pub async fn rename(&self, session_id: &str, nickname: &str) -> Result<Session> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| SchmuxError::NotFound(format!("session {session_id} not found")))?;

        let new_name = self
            .nickname_tmux_name(&session.workspace_id, nickname, &session.tmux_session)
            .await;
        if new_name != session.tmux_session {
            self.tmux
                .rename_session(&session.tmux_session, &new_name)
                .await?;
            if let Some(tracker) = self.trackers.get(session_id) {
                tracker.set_tmux_name(&new_name);
            }
        }

        self.store
            .update_session(session_id, |s| {
                s.nickname = Some(nickname.to_string());
                s.tmux_session = new_name.clone();
            })
            .await
    }

    async fn nickname_tmux_name(&self, workspace_id: &str, nickname: &str, current: &str) -> String {
        let slug = slugify(nickname);
        let base = format!("schmux-{workspace_id}-{slug}");
        if base == current || !self.store.tmux_name_in_use(&base).await {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if candidate == current || !self.store.tmux_name_in_use(&candidate).await {
                return candidate;
            }
            n += 1;
        }
    }

    /// Multiplexer-backed liveness with a short cache to damp polling.
    pub async fn is_running(&self, session_id: &str) -> Result<bool> {
        let ttl = self.config.read().await.internal.session_seen_interval();
        {
            let cache = self.liveness.lock().await;
            if let Some((at, running)) = cache.get(session_id) {
                if at.elapsed() < ttl {
                    return Ok(*running);
                }
            }
        }

        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| SchmuxError::NotFound(format!("session {session_id} not found")))?;
        let running = self.tmux.has_session(&session.tmux_session).await?;
        self.liveness
            .lock()
            .await
            .insert(session_id.to_string(), (Instant::now(), running));

        if !running && session.running {
            let _ = self
                .store
                .update_session(session_id, |s| s.running = false)
                .await;
        }
        Ok(running)
    }

    /// Re-track sessions that survived a process restart: sessions whose
    /// multiplexer session still exists get a fresh tracker (and hub), the
    /// rest are marked not-running.
    pub async fn restore_trackers(&self) {
        let terminal = self.config.read().await.terminal.clone();
        for session in self.store.list_sessions().await {
            let alive = matches!(self.tmux.has_session(&session.tmux_session).await, Ok(true));
            if !alive {
                if session.running {
                    let _ = self
                        .store
                        .update_session(&session.id, |s| s.running = false)
                        .await;
                }
                continue;
            }
            if self.trackers.get(&session.id).is_some() {
                continue;
            }

            let log_path = self.dirs.session_log_path(&session.id);
            // `pipe-pane -o` is a no-op when a pipe is already open.
            if let Err(e) = self
                .tmux
                .start_pipe(&session.tmux_session, &log_path.to_string_lossy())
                .await
            {
                warn!("restoring pipe for {}: {e}", session.id);
            }

            let tracker = StreamTracker::new(
                session.id.clone(),
                session.tmux_session.clone(),
                self.tmux.clone(),
                terminal
                    .filtered_sequences
                    .iter()
                    .map(|s| s.as_bytes().to_vec())
                    .collect(),
                log_path,
                terminal.max_log_size,
                terminal.rotated_log_size,
                self.events_tx.clone(),
            );
            self.trackers.insert(&session.id, tracker.clone());

            if session.render_mode == RenderMode::Html {
                let hub = Arc::new(StreamJsonHub::new(&session.id));
                self.hubs.insert(&session.id, Arc::clone(&hub));
                let (_sub, mut rx) = tracker.subscribe();
                tokio::spawn(async move {
                    while let Some(chunk) = rx.recv().await {
                        hub.feed(&chunk).await;
                    }
                });
            }
            info!("restored tracker for session {}", session.id);
        }
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Start the tracker event loop and the liveness poller.
    pub fn start_background(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let rx = this.events_rx.lock().await.take();
            let Some(mut rx) = rx else { return };
            while let Some(event) = rx.recv().await {
                this.handle_event(event).await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = this.config.read().await.internal.session_seen_interval();
                tokio::time::sleep(interval).await;
                this.poll_liveness().await;
            }
        });
    }

    async fn poll_liveness(&self) {
        for session in self.store.list_sessions().await {
            if !session.running {
                continue;
            }
            if let Err(e) = self.is_running(&session.id).await {
                // Fatal gateway errors here mean the multiplexer is gone;
                // nothing useful to do per session.
                debug!("liveness poll for {}: {e}", session.id);
            }
        }
    }

    async fn handle_event(&self, event: TrackerEvent) {
        match event {
            TrackerEvent::Output { session_id, at } => {
                let stamp = {
                    let mut stamped = self.output_stamped.lock().await;
                    match stamped.get(&session_id) {
                        Some(last) if last.elapsed() < OUTPUT_STAMP_DEBOUNCE => false,
                        _ => {
                            stamped.insert(session_id.clone(), Instant::now());
                            true
                        }
                    }
                };
                if stamp {
                    let _ = self
                        .store
                        .update_session(&session_id, |s| s.last_output_at = Some(at))
                        .await;
                    self.maybe_refresh_status(&session_id).await;
                }
            }
            TrackerEvent::Nudge {
                session_id,
                state,
                summary,
            } => {
                if !self.config.read().await.nudgenik.enabled {
                    return;
                }
                let _ = self
                    .store
                    .update_session(&session_id, |s| {
                        s.nudge_state = Some(state);
                        s.nudge_summary = summary.clone();
                    })
                    .await;
            }
            TrackerEvent::NudgeCleared { session_id } => {
                let _ = self
                    .store
                    .update_session(&session_id, |s| {
                        s.nudge_state = None;
                        s.nudge_summary = None;
                    })
                    .await;
            }
            TrackerEvent::Ended { session_id } => {
                let _ = self
                    .store
                    .update_session(&session_id, |s| s.running = false)
                    .await;
            }
        }
    }

    /// Output bursts refresh the owning workspace's git stats, debounced.
    async fn maybe_refresh_status(&self, session_id: &str) {
        let Some(session) = self.store.get_session(session_id).await else {
            return;
        };
        let workspace_id = session.workspace_id;
        {
            let mut refreshed = self.status_refreshed.lock().await;
            if let Some(last) = refreshed.get(&workspace_id) {
                if last.elapsed() < STATUS_REFRESH_DEBOUNCE {
                    return;
                }
            }
            refreshed.insert(workspace_id.clone(), Instant::now());
        }
        let _ = self.workspaces.git_status(&workspace_id, true).await;
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn validate_prompt(target: &RunTarget, prompt: Option<&str>) -> Result<()> {
    let has_prompt = prompt.map(|p| !p.trim().is_empty()).unwrap_or(false);
    match target.kind {
        TargetKind::Promptable if !has_prompt => Err(SchmuxError::Validation(format!(
            "target {} requires a prompt",
            target.name
        ))),
        TargetKind::Command if has_prompt => Err(SchmuxError::Validation(format!(
            "target {} does not accept a prompt",
            target.name
        ))),
        _ => Ok(()),
    }
}

/// Substitute prompt placeholders in the target's command template.
fn build_command(target: &RunTarget, prompt_file: Option<String>, prompt: Option<&str>) -> String {
    let mut command = target.command.clone();
    if let Some(path) = prompt_file {
        command = command.replace("{prompt_file}", &crate::tmux::shell_quote(&path));
    }
    if let Some(prompt) = prompt {
        command = command.replace("{prompt}", &crate::tmux::shell_quote(prompt));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promptable() -> RunTarget {
        RunTarget {
            name: "claude".to_string(),
            kind: TargetKind::Promptable,
            command: "claude --prompt-file {prompt_file}".to_string(),
            stream_json: false,
        }
    }

    fn command_target() -> RunTarget {
        RunTarget {
            name: "tests".to_string(),
            kind: TargetKind::Command,
            command: "cargo test".to_string(),
            stream_json: false,
        }
    }

    #[test]
    fn promptable_requires_prompt() {
        assert!(validate_prompt(&promptable(), None).is_err());
        assert!(validate_prompt(&promptable(), Some("  ")).is_err());
        assert!(validate_prompt(&promptable(), Some("do the thing")).is_ok());
    }

    #[test]
    fn command_rejects_prompt() {
        assert!(validate_prompt(&command_target(), Some("oops")).is_err());
        assert!(validate_prompt(&command_target(), None).is_ok());
        assert!(validate_prompt(&command_target(), Some("")).is_ok());
    }

    #[test]
    fn build_command_substitutes_prompt_file() {
        let command = build_command(
            &promptable(),
            Some("/data/prompts/abc.txt".to_string()),
            Some("ignored here"),
        );
        assert_eq!(command, "claude --prompt-file '/data/prompts/abc.txt'");
    }

    #[test]
    fn build_command_substitutes_inline_prompt() {
        let target = RunTarget {
            name: "agent".to_string(),
            kind: TargetKind::Promptable,
            command: "agent run {prompt}".to_string(),
            stream_json: false,
        };
        let command = build_command(&target, None, Some("fix the o'clock bug"));
        assert_eq!(command, r"agent run 'fix the o'\''clock bug'");
    }

    #[test]
    fn build_command_leaves_plain_commands_alone() {
        let command = build_command(&command_target(), None, None);
        assert_eq!(command, "cargo test");
    }

    #[test]
    fn session_ids_are_short_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
