use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SchmuxError};

/// Thin, per-call command surface over the external terminal multiplexer.
///
/// The gateway holds no long-lived state; every operation shells out and is
/// bounded by a deadline. Long-lived attach is the stream tracker's job.
#[derive(Clone)]
pub struct TmuxGateway {
    bin: String,
    timeout: Duration,
}

impl TmuxGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            bin: "tmux".to_string(),
            timeout,
        }
    }

    /// Same gateway with a different deadline for one call site.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            bin: self.bin.clone(),
            timeout,
        }
    }

    /// The attach command a PTY-owning tracker should spawn.
    pub fn attach_command(&self, name: &str) -> (String, Vec<String>) {
        (
            self.bin.clone(),
            vec!["attach-session".to_string(), "-t".to_string(), format!("={name}")],
        )
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        debug!("tmux {}", args.join(" "));
        let fut = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| {
                SchmuxError::Transient(format!("tmux {} timed out", args.first().unwrap_or(&"")))
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SchmuxError::Fatal(format!("{} binary not found on PATH", self.bin))
                } else {
                    SchmuxError::Transient(format!("failed to run {}: {e}", self.bin))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Create a detached session running `command` in `cwd`.
    pub async fn new_session(
        &self,
        name: &str,
        cwd: &str,
        command: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd.into(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(command.into());
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec(&borrowed).await?;
        Ok(())
    }

    pub async fn kill_session(&self, name: &str) -> Result<()> {
        self.exec(&["kill-session", "-t", &exact(name)]).await?;
        Ok(())
    }

    pub async fn rename_session(&self, name: &str, new_name: &str) -> Result<()> {
        self.exec(&["rename-session", "-t", &exact(name), new_name])
            .await?;
        Ok(())
    }

    /// Send literal text to the session (no key-name interpretation).
    pub async fn send_keys(&self, name: &str, text: &str) -> Result<()> {
        self.exec(&["send-keys", "-t", &exact(name), "-l", "--", text])
            .await?;
        Ok(())
    }

    pub async fn resize_window(&self, name: &str, cols: u16, rows: u16) -> Result<()> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        self.exec(&["resize-window", "-t", &exact(name), "-x", &cols, "-y", &rows])
            .await?;
        Ok(())
    }

    pub async fn get_window_size(&self, name: &str) -> Result<(u16, u16)> {
        let out = self
            .exec(&[
                "display-message",
                "-p",
                "-t",
                &exact(name),
                "#{window_width}x#{window_height}",
            ])
            .await?;
        parse_window_size(&out)
            .ok_or_else(|| SchmuxError::Transient(format!("unparseable window size: {out:?}")))
    }

    /// Capture the last `lines` of scrollback. With `with_escapes` the output
    /// keeps color/attribute sequences for the browser emulator to replay.
    pub async fn capture_pane(&self, name: &str, lines: u32, with_escapes: bool) -> Result<Vec<u8>> {
        let start = format!("-{lines}");
        let target = exact(name);
        let mut args: Vec<&str> = vec!["capture-pane", "-p", "-t", target.as_str(), "-S", start.as_str()];
        if with_escapes {
            args.push("-e");
        }
        let out = self.exec(&args).await?;
        Ok(out.into_bytes())
    }

    /// Append all pane bytes to `path` until stopped.
    pub async fn start_pipe(&self, name: &str, path: &str) -> Result<()> {
        let sink = format!("cat >> {}", shell_quote(path));
        self.exec(&["pipe-pane", "-o", "-t", &exact(name), &sink])
            .await?;
        Ok(())
    }

    pub async fn stop_pipe(&self, name: &str) -> Result<()> {
        self.exec(&["pipe-pane", "-t", &exact(name)]).await?;
        Ok(())
    }

    pub async fn set_option(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.exec(&["set-option", "-t", &exact(name), key, value])
            .await?;
        Ok(())
    }

    /// PID of the process running in the session's pane.
    pub async fn pane_pid(&self, name: &str) -> Result<Option<u32>> {
        let out = self
            .exec(&["display-message", "-p", "-t", &exact(name), "#{pane_pid}"])
            .await?;
        Ok(out.trim().parse().ok())
    }

    pub async fn has_session(&self, name: &str) -> Result<bool> {
        match self.exec(&["has-session", "-t", &exact(name)]).await {
            Ok(_) => Ok(true),
            Err(SchmuxError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Prefix with `=` so tmux matches the name exactly instead of by prefix.
fn exact(name: &str) -> String {
    format!("={name}")
}

/// Classify a failed tmux invocation from its stderr.
///
/// `NotFound` is never retried; `Transient` may be retried once by callers;
/// `Fatal` propagates (unknown output from the binary is treated as fatal
/// because the gateway cannot reason about it).
pub fn classify_failure(stderr: &str) -> SchmuxError {
    let lower = stderr.to_lowercase();
    if lower.contains("can't find session")
        || lower.contains("no such session")
        || lower.contains("session not found")
        || lower.contains("no server running")
    {
        SchmuxError::NotFound(stderr.to_string())
    } else if lower.contains("lost server")
        || lower.contains("server exited")
        || lower.contains("connection refused")
    {
        SchmuxError::Transient(stderr.to_string())
    } else {
        SchmuxError::Fatal(format!("tmux: {stderr}"))
    }
}

pub fn parse_window_size(out: &str) -> Option<(u16, u16)> {
    let (w, h) = out.trim().split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Single-quote for the shell command embedded in `pipe-pane`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_missing_session_as_not_found() {
        assert!(matches!(
            classify_failure("can't find session: schmux-x-1"),
            SchmuxError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("no server running on /tmp/tmux-1000/default"),
            SchmuxError::NotFound(_)
        ));
    }

    #[test]
    fn classify_io_glitch_as_transient() {
        assert!(matches!(
            classify_failure("lost server"),
            SchmuxError::Transient(_)
        ));
    }

    #[test]
    fn classify_unknown_as_fatal() {
        assert!(matches!(
            classify_failure("usage: tmux [-2CDlNuVv ...]"),
            SchmuxError::Fatal(_)
        ));
    }

    #[test]
    fn parse_window_size_ok() {
        assert_eq!(parse_window_size("120x40\n"), Some((120, 40)));
        assert_eq!(parse_window_size("80x24"), Some((80, 24)));
    }

    #[test]
    fn parse_window_size_rejects_garbage() {
        assert_eq!(parse_window_size(""), None);
        assert_eq!(parse_window_size("120"), None);
        assert_eq!(parse_window_size("axb"), None);
    }

    #[test]
    fn shell_quote_handles_single_quotes() {
        assert_eq!(shell_quote("/tmp/plain.log"), "'/tmp/plain.log'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn attach_command_targets_exact_name() {
        let gw = TmuxGateway::new(Duration::from_secs(5));
        let (bin, args) = gw.attach_command("schmux-ws-1");
        assert_eq!(bin, "tmux");
        assert_eq!(args, vec!["attach-session", "-t", "=schmux-ws-1"]);
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let gw = TmuxGateway {
            bin: "definitely-not-a-real-multiplexer".to_string(),
            timeout: Duration::from_secs(2),
        };
        match gw.has_session("x").await {
            Err(SchmuxError::Fatal(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected Fatal, got {other:?}"),
        }
    }
}
