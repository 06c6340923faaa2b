use std::path::Path;
use std::time::Duration;

/// Run a git command in the given working directory, returning stdout on
/// success and trimmed stderr on failure.
pub async fn run_git(working_dir: &Path, args: &[&str]) -> Result<String, String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await
        .map_err(|e| format!("Failed to run git: {}", e))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Deadline-bounded variant for calls that may touch the network.
pub async fn run_git_timeout(
    working_dir: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<String, String> {
    tokio::time::timeout(timeout, run_git(working_dir, args))
        .await
        .map_err(|_| format!("git {} timed out", args.first().unwrap_or(&"")))?
}

/// Raw bytes variant, for file contents that may not be UTF-8.
pub async fn run_git_bytes(working_dir: &Path, args: &[&str]) -> Result<Vec<u8>, String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .await
        .map_err(|e| format!("Failed to run git: {}", e))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(output.stdout)
}
