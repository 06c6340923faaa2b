use anyhow::Context;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::PtyError;

/// Configuration for spawning a command under a PTY
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Point-in-time state of the bridged process
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
}

/// One read from the PTY master
#[derive(Clone, Debug)]
pub struct PtyChunk {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

enum PtyMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Kill {
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

/// Cloneable handle to a bridged PTY.
///
/// Output is a broadcast of [`PtyChunk`]s; `exited` flips to true exactly once,
/// when the reader hits EOF or the child is reaped.
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    output_tx: broadcast::Sender<PtyChunk>,
    exited: watch::Receiver<bool>,
}

impl PtyHandle {
    /// Write bytes to the PTY (the process's stdin).
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("write".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("write".into()))?
    }

    /// Change the PTY window size.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("resize".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelClosed("resize".into()))?
    }

    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelClosed("state".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("state".into()))
    }

    /// Terminate the child with SIGTERM (hard kill on non-unix).
    pub async fn kill(&self) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Kill { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelClosed("kill".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("kill".into()))?
    }

    /// Subscribe to raw output chunks.
    pub fn subscribe(&self) -> broadcast::Receiver<PtyChunk> {
        self.output_tx.subscribe()
    }

    /// Resolves once the process has exited and the reader drained.
    pub async fn wait_exited(&self) {
        let mut rx = self.exited.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True if the exit flag has already been raised.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
    exited_tx: watch::Sender<bool>,
}

/// Spawn `config.command` under a fresh PTY and return a handle to it.
pub fn spawn_pty(config: PtyConfig) -> Result<PtyHandle, PtyError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(PtySize {
            rows: config.rows,
            cols: config.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open PTY")
        .map_err(PtyError::from)?;

    let mut cmd = CommandBuilder::new(&config.command);
    for arg in &config.args {
        cmd.arg(arg);
    }
    if let Some(dir) = &config.cwd {
        cmd.cwd(dir);
    }

    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for key in ["PATH", "HOME", "USER"] {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    debug!(
        "Spawning PTY command: {} with args: {:?}",
        config.command, config.args
    );

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    let pid = child.process_id();

    let state = PtyState {
        running: true,
        pid,
        rows: config.rows,
        cols: config.cols,
    };

    let (output_tx, _) = broadcast::channel(1024);
    let (msg_tx, msg_rx) = mpsc::channel(32);
    let (exited_tx, exited_rx) = watch::channel(false);

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("Failed to clone PTY reader")
        .map_err(PtyError::from)?;

    let mut actor = PtyActor {
        master: pair.master,
        writer: None,
        child,
        state,
        receiver: msg_rx,
        exited_tx: exited_tx.clone(),
    };

    // Blocking reader thread: the PTY master has no async read path.
    let output_tx_reader = output_tx.clone();
    std::thread::spawn(move || {
        let mut buffer = vec![0u8; 8192];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("PTY EOF, process exited");
                    break;
                }
                Ok(n) => {
                    let _ = output_tx_reader.send(PtyChunk {
                        data: buffer[..n].to_vec(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    });
                }
                Err(e) => {
                    warn!("PTY read error: {}", e);
                    break;
                }
            }
        }
        let _ = exited_tx.send(true);
    });

    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(PtyHandle {
        sender: msg_tx,
        output_tx,
        exited: exited_rx,
    })
}

impl PtyActor {
    async fn run(&mut self) {
        info!("PTY actor started (pid {:?})", self.state.pid);

        // Take the writer up front so the slave's stdin stays open.
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => warn!("Failed to get PTY writer: {}", e),
        }

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PtyMessage::Write { data, respond_to } => {
                    let _ = respond_to.send(self.handle_write(&data));
                }
                PtyMessage::Resize {
                    rows,
                    cols,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.handle_resize(rows, cols));
                }
                PtyMessage::GetState { respond_to } => {
                    self.refresh_running();
                    let _ = respond_to.send(self.state.clone());
                }
                PtyMessage::Kill { respond_to } => {
                    let result = self.handle_kill();
                    let killed = result.is_ok();
                    let _ = respond_to.send(result);
                    if killed {
                        break;
                    }
                }
            }

            if let Ok(Some(status)) = self.child.try_wait() {
                debug!("PTY process exited with status: {:?}", status);
                self.state.running = false;
                self.state.pid = None;
                let _ = self.exited_tx.send(true);
                break;
            }
        }

        debug!("PTY actor shutting down");
    }

    fn refresh_running(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            self.state.running = false;
            self.state.pid = None;
        }
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if !self.state.running {
            return Err(PtyError::ProcessExited);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("no PTY writer available".into()))?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_kill(&mut self) -> Result<(), PtyError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.state.pid {
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| PtyError::KillFailed(e.to_string()))?;
            }
        }
        #[cfg(not(unix))]
        {
            self.child
                .kill()
                .map_err(|e| PtyError::KillFailed(e.to_string()))?;
        }

        self.state.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_shape() {
        let config = PtyConfig::default();
        assert_eq!(config.rows, 24);
        assert_eq!(config.cols, 80);
        assert!(config.args.is_empty());
        assert!(config.cwd.is_none());
    }

    #[tokio::test]
    async fn spawn_echo_streams_output_and_exits() {
        let handle = spawn_pty(PtyConfig {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "printf 'hi-there'".to_string()],
            ..Default::default()
        })
        .expect("spawn");

        let mut rx = handle.subscribe();
        let mut collected = Vec::new();
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(chunk)) => collected.extend_from_slice(&chunk.data),
                _ => break,
            }
            if String::from_utf8_lossy(&collected).contains("hi-there") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hi-there"));

        tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait_exited())
            .await
            .expect("process should exit");
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn write_reaches_process() {
        let handle = spawn_pty(PtyConfig {
            command: "/bin/cat".to_string(),
            ..Default::default()
        })
        .expect("spawn");

        handle.write(b"roundtrip\n").await.expect("write");

        let mut rx = handle.subscribe();
        let mut collected = Vec::new();
        for _ in 0..20 {
            match tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await {
                Ok(Ok(chunk)) => collected.extend_from_slice(&chunk.data),
                _ => break,
            }
            if String::from_utf8_lossy(&collected).contains("roundtrip") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("roundtrip"));

        handle.kill().await.expect("kill");
    }

    #[tokio::test]
    async fn resize_updates_state() {
        let handle = spawn_pty(PtyConfig {
            command: "/bin/cat".to_string(),
            ..Default::default()
        })
        .expect("spawn");

        handle.resize(40, 120).await.expect("resize");
        let state = handle.state().await.expect("state");
        assert_eq!(state.rows, 40);
        assert_eq!(state.cols, 120);

        handle.kill().await.expect("kill");
    }
}
