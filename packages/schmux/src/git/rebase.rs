use std::path::Path;
use std::time::Duration;

use super::executor::{run_git, run_git_timeout};

/// Where a rebase step landed.
#[derive(Debug, Clone, PartialEq)]
pub enum RebaseOutcome {
    Clean,
    Conflict {
        files: Vec<String>,
        /// The local commit being replayed when the rebase stopped.
        local_commit: Option<String>,
    },
}

/// Both sides of a conflicted file during a rebase, plus the marker-laden
/// working-tree content. Stage 2 is the upstream side, stage 3 the local
/// commit being replayed.
#[derive(Debug, Clone)]
pub struct ConflictSides {
    pub upstream: String,
    pub local: String,
    pub merged: String,
}

pub async fn fetch(dir: &Path, timeout: Duration) -> Result<(), String> {
    run_git_timeout(dir, &["fetch", "--prune"], timeout).await?;
    Ok(())
}

pub async fn head_hash(dir: &Path) -> Result<String, String> {
    Ok(run_git(dir, &["rev-parse", "HEAD"]).await?.trim().to_string())
}

pub async fn has_upstream(dir: &Path) -> bool {
    run_git(dir, &["rev-parse", "--abbrev-ref", "@{upstream}"])
        .await
        .is_ok()
}

/// Start rebasing onto the upstream. A non-zero exit with unmerged paths is
/// a conflict stop, not an error.
pub async fn rebase_upstream(dir: &Path) -> Result<RebaseOutcome, String> {
    match run_git(dir, &["rebase", "@{upstream}"]).await {
        Ok(_) => Ok(RebaseOutcome::Clean),
        Err(e) => conflict_or_error(dir, e).await,
    }
}

/// Continue after conflicted files were staged. `core.editor=true` keeps git
/// from opening an editor for the replayed commit message.
pub async fn rebase_continue(dir: &Path) -> Result<RebaseOutcome, String> {
    match run_git(dir, &["-c", "core.editor=true", "rebase", "--continue"]).await {
        Ok(_) => Ok(RebaseOutcome::Clean),
        Err(e) => conflict_or_error(dir, e).await,
    }
}

async fn conflict_or_error(dir: &Path, rebase_err: String) -> Result<RebaseOutcome, String> {
    let files = conflicted_files(dir).await?;
    if files.is_empty() {
        return Err(rebase_err);
    }
    let local_commit = run_git(dir, &["rev-parse", "REBASE_HEAD"])
        .await
        .ok()
        .map(|s| s.trim().to_string());
    Ok(RebaseOutcome::Conflict {
        files,
        local_commit,
    })
}

pub async fn conflicted_files(dir: &Path) -> Result<Vec<String>, String> {
    let out = run_git(dir, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(parse_name_list(&out))
}

pub async fn conflict_sides(dir: &Path, file: &str) -> Result<ConflictSides, String> {
    let upstream_spec = format!(":2:{file}");
    let local_spec = format!(":3:{file}");
    // A side may be absent entirely (add/add or delete conflicts).
    let upstream = run_git(dir, &["show", &upstream_spec]).await.unwrap_or_default();
    let local = run_git(dir, &["show", &local_spec]).await.unwrap_or_default();
    let merged = tokio::fs::read_to_string(dir.join(file))
        .await
        .unwrap_or_default();
    Ok(ConflictSides {
        upstream,
        local,
        merged,
    })
}

pub async fn stage_files(dir: &Path, files: &[String]) -> Result<(), String> {
    let mut args = vec!["add", "--"];
    args.extend(files.iter().map(String::as_str));
    run_git(dir, &args).await?;
    Ok(())
}

pub fn parse_name_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_list_parsing() {
        assert!(parse_name_list("").is_empty());
        assert_eq!(
            parse_name_list("src/a.rs\nsrc/b.rs\n\n"),
            vec!["src/a.rs", "src/b.rs"]
        );
    }

    #[tokio::test]
    async fn rebase_in_clean_repo_is_an_error_without_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();
        run_git(path, &["init", "-b", "main", "."]).await.unwrap();
        // No upstream configured: rebase fails and there are no conflicted
        // files, so the error propagates rather than being misread as a
        // conflict stop.
        assert!(rebase_upstream(path).await.is_err());
        assert!(!has_upstream(path).await);
    }
}
