use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::executor::{run_git, run_git_timeout};

/// Network-bound git operations get a generous deadline.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Identify of an on-disk working copy: `(repo, branch)`.
pub async fn identify(dir: &Path) -> Option<(String, String)> {
    let inside = run_git(dir, &["rev-parse", "--is-inside-work-tree"]).await.ok()?;
    if inside.trim() != "true" {
        return None;
    }
    let repo = run_git(dir, &["remote", "get-url", "origin"]).await.ok()?;
    let branch = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await.ok()?;
    Some((repo.trim().to_string(), branch.trim().to_string()))
}

pub async fn is_working_copy(dir: &Path) -> bool {
    run_git(dir, &["rev-parse", "--git-dir"]).await.is_ok()
}

/// Create a working copy of `repo` pinned to `branch` at `dest`.
///
/// When `sibling` names an existing local working copy of the same repo, a
/// linked worktree is preferred over a second full clone. Falls back to
/// cloning when the worktree add fails (e.g. branch already checked out).
pub async fn create_working_copy(
    repo: &str,
    branch: &str,
    dest: &Path,
    sibling: Option<&Path>,
) -> Result<(), String> {
    if let Some(sibling) = sibling {
        let dest_str = dest.to_string_lossy().to_string();
        // Track the remote branch when it exists, otherwise branch off HEAD.
        let tracked = run_git_timeout(
            sibling,
            &["worktree", "add", "--track", "-B", branch, &dest_str, &format!("origin/{branch}")],
            CLONE_TIMEOUT,
        )
        .await;
        match tracked {
            Ok(_) => return Ok(()),
            Err(e) => debug!("worktree add tracking origin/{branch} failed: {e}"),
        }
        if run_git_timeout(sibling, &["worktree", "add", "-b", branch, &dest_str], CLONE_TIMEOUT)
            .await
            .is_ok()
        {
            return Ok(());
        }
    }

    let dest_str = dest.to_string_lossy().to_string();
    let parent = dest.parent().unwrap_or(Path::new("."));
    match run_git_timeout(
        parent,
        &["clone", "--branch", branch, repo, &dest_str],
        CLONE_TIMEOUT,
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.contains("not found in upstream") || e.contains("Remote branch") => {
            // Branch does not exist remotely yet: clone the default branch
            // and create it locally.
            run_git_timeout(parent, &["clone", repo, &dest_str], CLONE_TIMEOUT).await?;
            run_git(dest, &["checkout", "-b", branch]).await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Remove the working copy at `dir`. Linked worktrees are detached through
/// git so the parent clone's bookkeeping stays consistent; plain clones are
/// deleted from the filesystem.
pub async fn remove_working_copy(dir: &Path) -> Result<(), String> {
    let dir_str = dir.to_string_lossy().to_string();
    if is_linked_worktree(dir).await {
        if run_git(dir, &["worktree", "remove", "--force", &dir_str]).await.is_ok() {
            return Ok(());
        }
    }
    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|e| format!("removing {}: {e}", dir.display()))
}

async fn is_linked_worktree(dir: &Path) -> bool {
    // In a linked worktree `.git` is a file pointing at the parent clone.
    tokio::fs::metadata(dir.join(".git"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identify_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(identify(dir.path()).await.is_none());
        assert!(!is_working_copy(dir.path()).await);
    }

    #[tokio::test]
    async fn identify_reads_real_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();
        run_git(path, &["init", "-b", "main", "."]).await.unwrap();
        run_git(path, &["remote", "add", "origin", "git@example.com:me/proj.git"])
            .await
            .unwrap();

        assert!(is_working_copy(path).await);
        let (repo, branch) = identify(path).await.expect("identify");
        assert_eq!(repo, "git@example.com:me/proj.git");
        assert_eq!(branch, "main");
    }

    #[tokio::test]
    async fn remove_plain_clone_deletes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let copy = dir.path().join("copy");
        std::fs::create_dir_all(copy.join(".git")).unwrap();
        std::fs::write(copy.join("file.txt"), "x").unwrap();

        remove_working_copy(&copy).await.unwrap();
        assert!(!copy.exists());
    }
}
