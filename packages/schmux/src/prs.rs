use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SchmuxError};
use crate::models::{PullRequest, Workspace};
use crate::state::StateStore;
use crate::workspace::WorkspaceManager;

/// Read-only pull-request cache, refreshed through the `gh` CLI and
/// persisted so the UI sees last-good data on startup.
pub struct PrCache {
    store: Arc<StateStore>,
    config: Arc<RwLock<Config>>,
    workspaces: Arc<WorkspaceManager>,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    title: String,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
    author: GhAuthor,
    #[serde(rename = "updatedAt")]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GhAuthor {
    login: String,
}

impl PrCache {
    pub fn new(
        store: Arc<StateStore>,
        config: Arc<RwLock<Config>>,
        workspaces: Arc<WorkspaceManager>,
    ) -> Self {
        Self {
            store,
            config,
            workspaces,
        }
    }

    pub async fn list(&self) -> Vec<PullRequest> {
        self.store.list_pull_requests().await
    }

    /// Re-run discovery across every configured repo. Repos the helper
    /// cannot reach keep their previous entries.
    pub async fn refresh(&self) -> Result<Vec<PullRequest>> {
        let repos = self.config.read().await.repos.clone();
        let mut fresh: Vec<PullRequest> = Vec::new();
        let mut failed_repos: Vec<String> = Vec::new();

        for repo in &repos {
            let Some(slug) = parse_repo_slug(repo) else {
                debug!("{repo} is not a GitHub repo, skipping PR discovery");
                continue;
            };
            match discover(&slug).await {
                Ok(prs) => fresh.extend(prs.into_iter().map(|pr| PullRequest {
                    repo_url: repo.clone(),
                    number: pr.number,
                    title: pr.title,
                    head_ref: pr.head_ref_name,
                    author: pr.author.login,
                    updated_at: pr.updated_at,
                })),
                Err(e) => {
                    warn!("PR discovery for {repo} failed: {e}");
                    failed_repos.push(repo.clone());
                }
            }
        }

        // Keep last-good entries for repos that failed this round.
        let previous = self.store.list_pull_requests().await;
        fresh.extend(
            previous
                .into_iter()
                .filter(|pr| failed_repos.contains(&pr.repo_url)),
        );

        self.store.set_pull_requests(fresh.clone()).await;
        Ok(fresh)
    }

    /// Materialize a workspace for the PR's head branch.
    pub async fn checkout(&self, repo_url: &str, number: u64) -> Result<Workspace> {
        let pr = self
            .store
            .list_pull_requests()
            .await
            .into_iter()
            .find(|pr| pr.repo_url == repo_url && pr.number == number)
            .ok_or_else(|| {
                SchmuxError::NotFound(format!("pull request {repo_url}#{number} not in cache"))
            })?;
        self.workspaces.ensure(&pr.repo_url, &pr.head_ref).await
    }
}

async fn discover(slug: &str) -> std::result::Result<Vec<GhPullRequest>, String> {
    let output = tokio::process::Command::new("gh")
        .args([
            "pr",
            "list",
            "--repo",
            slug,
            "--json",
            "number,title,headRefName,author,updatedAt",
        ])
        .output()
        .await
        .map_err(|e| format!("running gh: {e}"))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    serde_json::from_slice(&output.stdout).map_err(|e| format!("parsing gh output: {e}"))
}

/// Extract `owner/repo` from the GitHub remote URL forms in use: ssh
/// (`git@github.com:o/r.git`), https, and `git://`.
pub fn parse_repo_slug(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("git@github.com:")
        .or_else(|| url.strip_prefix("https://github.com/"))
        .or_else(|| url.strip_prefix("http://github.com/"))
        .or_else(|| url.strip_prefix("ssh://git@github.com/"))
        .or_else(|| url.strip_prefix("git://github.com/"))?;
    let slug = rest.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = slug.splitn(2, '/');
    let owner = parts.next()?;
    let repo = parts.next()?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some(format!("{owner}/{repo}"))
}
