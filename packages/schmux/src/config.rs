use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SchmuxError;
use crate::models::QuickLaunchEntry;

// =============================================================================
// Config file (single JSON document at <data_dir>/config.json)
// =============================================================================

/// How a run target is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// The agent accepts a user prompt; `prompt` is required at spawn.
    Promptable,
    /// A plain command; `prompt` must be absent at spawn.
    Command,
}

/// A named launch recipe. Immutable at runtime (reloaded only on config
/// reload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTarget {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// Launch command template. `{prompt_file}` and `{prompt}` are
    /// substituted for promptable targets; a promptable template with
    /// neither placeholder gets the prompt typed into its stdin after
    /// launch.
    pub command: String,
    /// The agent emits structured JSON on stdout (html render mode).
    #[serde(default)]
    pub stream_json: bool,
}

impl RunTarget {
    /// Ad-hoc target for a raw command supplied at spawn time.
    pub fn adhoc(command: &str) -> Self {
        Self {
            name: "command".to_string(),
            kind: TargetKind::Command,
            command: command.to_string(),
            stream_json: false,
        }
    }

    /// Promptable targets without a template placeholder take the prompt
    /// over stdin.
    pub fn prompt_via_stdin(&self) -> bool {
        self.kind == TargetKind::Promptable
            && !self.command.contains("{prompt_file}")
            && !self.command.contains("{prompt}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsKind {
    Git,
}

/// Remote-host connection profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFlavor {
    pub id: String,
    pub name: String,
    /// Working-copy root on the remote.
    pub workspace_root: String,
    pub connect_cmd: String,
    pub reconnect_cmd: String,
    #[serde(default)]
    pub provision_cmd: Option<String>,
    pub vcs: VcsKind,
    #[serde(default)]
    pub vscode_cmd: Option<String>,
    /// Regex matched against provisioning output to detect the hostname.
    pub hostname_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NudgenikConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NudgenikConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Terminal streaming tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: u32,
    /// Control sequences stripped byte-for-byte from tracker output.
    #[serde(default = "default_filtered_sequences")]
    pub filtered_sequences: Vec<String>,
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    #[serde(default = "default_rotated_log_size")]
    pub rotated_log_size: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: default_scrollback_lines(),
            filtered_sequences: default_filtered_sequences(),
            max_log_size: default_max_log_size(),
            rotated_log_size: default_rotated_log_size(),
        }
    }
}

/// Conflict-resolution helper endpoint (Anthropic-style messages API).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalConfig {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_session_seen_interval_ms")]
    pub session_seen_interval_ms: u64,
    #[serde(default = "default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,
    #[serde(default = "default_remote_ttl_secs")]
    pub remote_ttl_secs: u64,
    #[serde(default)]
    pub resolver: Option<ResolverConfig>,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            session_seen_interval_ms: default_session_seen_interval_ms(),
            provision_timeout_secs: default_provision_timeout_secs(),
            remote_ttl_secs: default_remote_ttl_secs(),
            resolver: None,
        }
    }
}

impl InternalConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn session_seen_interval(&self) -> Duration {
        Duration::from_millis(self.session_seen_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubOauthConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessControlConfig {
    pub github_oauth: GithubOauthConfig,
    #[serde(default)]
    pub allowed_logins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub run_targets: Vec<RunTarget>,
    #[serde(default)]
    pub quick_launch: Vec<QuickLaunchEntry>,
    #[serde(default)]
    pub remote_flavors: Vec<RemoteFlavor>,
    #[serde(default)]
    pub nudgenik: NudgenikConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub internal: InternalConfig,
    #[serde(default)]
    pub access_control: Option<AccessControlConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_path: default_workspace_path(),
            repos: Vec::new(),
            run_targets: vec![RunTarget {
                name: "shell".to_string(),
                kind: TargetKind::Command,
                command: std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
                stream_json: false,
            }],
            quick_launch: Vec::new(),
            remote_flavors: Vec::new(),
            nudgenik: NudgenikConfig::default(),
            terminal: TerminalConfig::default(),
            internal: InternalConfig::default(),
            access_control: None,
        }
    }
}

impl Config {
    pub fn target(&self, name: &str) -> Option<&RunTarget> {
        self.run_targets.iter().find(|t| t.name == name)
    }

    pub fn flavor(&self, id: &str) -> Option<&RemoteFlavor> {
        self.remote_flavors.iter().find(|f| f.id == id)
    }

    pub fn workspace_root(&self) -> PathBuf {
        expand_home(&self.workspace_path)
    }

    /// Reject configs the managers cannot operate on.
    pub fn validate(&self) -> std::result::Result<(), SchmuxError> {
        let mut seen = std::collections::HashSet::new();
        for target in &self.run_targets {
            if target.name.is_empty() {
                return Err(SchmuxError::Validation("run target with empty name".into()));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(SchmuxError::Validation(format!(
                    "duplicate run target: {}",
                    target.name
                )));
            }
        }

        let mut flavors = std::collections::HashSet::new();
        for flavor in &self.remote_flavors {
            if !flavors.insert(flavor.id.as_str()) {
                return Err(SchmuxError::Validation(format!(
                    "duplicate remote flavor: {}",
                    flavor.id
                )));
            }
            regex::Regex::new(&flavor.hostname_pattern).map_err(|e| {
                SchmuxError::Validation(format!(
                    "flavor {} has invalid hostname_pattern: {}",
                    flavor.id, e
                ))
            })?;
        }

        for entry in &self.quick_launch {
            if self.target(&entry.target).is_none() {
                return Err(SchmuxError::Validation(format!(
                    "quick launch {} references unknown target {}",
                    entry.name, entry.target
                )));
            }
        }

        Ok(())
    }
}

/// Expand a leading `~` or `$HOME` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("$HOME/")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" || path == "$HOME" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// =============================================================================
// Data directories
// =============================================================================

/// Resolved filesystem layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub state_path: PathBuf,
    pub config_path: PathBuf,
}

impl DataDirs {
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("cannot determine home directory")?
                .join(".schmux"),
        };
        let dirs = Self {
            logs_dir: data_dir.join("logs"),
            prompts_dir: data_dir.join("prompts"),
            state_path: data_dir.join("state.json"),
            config_path: data_dir.join("config.json"),
            data_dir,
        };
        std::fs::create_dir_all(&dirs.logs_dir)?;
        std::fs::create_dir_all(&dirs.prompts_dir)?;
        Ok(dirs)
    }

    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{session_id}.log"))
    }

    pub fn prompt_path(&self, session_id: &str) -> PathBuf {
        self.prompts_dir.join(format!("{session_id}.txt"))
    }
}

/// Load the config file, tolerating a missing file (defaults) and rejecting
/// corrupt or invalid content.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str::<Config>(&text)
            .with_context(|| format!("invalid config at {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    Ok(config)
}

/// Persist the config with the same temp + rename discipline as the state
/// file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    let text = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_workspace_path() -> String {
    "~/schmux/workspaces".to_string()
}

fn default_scrollback_lines() -> u32 {
    2000
}

/// Mouse-tracking and alternate-screen toggles, both set and reset forms.
/// These break the browser-side emulator's scrollback.
fn default_filtered_sequences() -> Vec<String> {
    [
        "\x1b[?1000h", "\x1b[?1000l", "\x1b[?1002h", "\x1b[?1002l", "\x1b[?1003h", "\x1b[?1003l",
        "\x1b[?1006h", "\x1b[?1006l", "\x1b[?1015h", "\x1b[?1015l", "\x1b[?1049h", "\x1b[?1049l",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_max_log_size() -> u64 {
    10 * 1024 * 1024
}

fn default_rotated_log_size() -> u64 {
    1024 * 1024
}

fn default_confidence_floor() -> f64 {
    0.5
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_session_seen_interval_ms() -> u64 {
    1000
}

fn default_provision_timeout_secs() -> u64 {
    600
}

fn default_remote_ttl_secs() -> u64 {
    8 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.target("shell").is_some());
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.workspace_path, "~/schmux/workspaces");
        assert_eq!(config.terminal.max_log_size, 10 * 1024 * 1024);
        assert_eq!(config.terminal.rotated_log_size, 1024 * 1024);
        assert_eq!(config.internal.command_timeout_secs, 10);
        assert!(config.nudgenik.enabled);
    }

    #[test]
    fn target_kind_tagged_as_type() {
        let json = serde_json::json!({
            "name": "claude",
            "type": "promptable",
            "command": "claude --prompt-file {prompt_file}",
        });
        let target: RunTarget = serde_json::from_value(json).unwrap();
        assert_eq!(target.kind, TargetKind::Promptable);
        assert!(!target.stream_json);
    }

    #[test]
    fn prompt_delivery_mode_from_template() {
        let file_target = RunTarget {
            name: "a".to_string(),
            kind: TargetKind::Promptable,
            command: "agent --prompt-file {prompt_file}".to_string(),
            stream_json: false,
        };
        let stdin_target = RunTarget {
            name: "b".to_string(),
            kind: TargetKind::Promptable,
            command: "agent".to_string(),
            stream_json: false,
        };
        let command_target = RunTarget {
            name: "c".to_string(),
            kind: TargetKind::Command,
            command: "make test".to_string(),
            stream_json: false,
        };
        assert!(!file_target.prompt_via_stdin());
        assert!(stdin_target.prompt_via_stdin());
        assert!(!command_target.prompt_via_stdin());
    }

    #[test]
    fn duplicate_target_rejected() {
        let mut config = Config::default();
        let shell = config.run_targets[0].clone();
        config.run_targets.push(shell);
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_flavor_regex_rejected() {
        let mut config = Config::default();
        config.remote_flavors.push(RemoteFlavor {
            id: "f1".to_string(),
            name: "Flavor".to_string(),
            workspace_root: "/work".to_string(),
            connect_cmd: "ssh box".to_string(),
            reconnect_cmd: "ssh box".to_string(),
            provision_cmd: None,
            vcs: VcsKind::Git,
            vscode_cmd: None,
            hostname_pattern: "([unclosed".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn quick_launch_unknown_target_rejected() {
        let mut config = Config::default();
        config.quick_launch.push(QuickLaunchEntry {
            name: "tests".to_string(),
            target: "nope".to_string(),
            prompt: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_filter_covers_mouse_and_alt_screen() {
        let seqs = default_filtered_sequences();
        assert!(seqs.contains(&"\x1b[?1000h".to_string()));
        assert!(seqs.contains(&"\x1b[?1006h".to_string()));
        assert!(seqs.contains(&"\x1b[?1049h".to_string()));
        assert!(seqs.contains(&"\x1b[?1049l".to_string()));
    }

    #[test]
    fn expand_home_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~/x/y"), home.join("x/y"));
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn load_missing_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_corrupt_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.repos.push("git@example.com:me/proj.git".to_string());
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
