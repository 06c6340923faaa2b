use chrono::{DateTime, Utc};
use pty_bridge::{PtyConfig, PtyHandle, spawn_pty};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchmuxError};
use crate::models::NudgeState;
use crate::nudge::{NudgeScanner, input_clears_nudge};
use crate::tmux::TmuxGateway;

/// Per-subscriber queue depth. A subscriber that falls this many chunks
/// behind is disconnected rather than blocking the producer.
const SUBSCRIBER_QUEUE: usize = 16;

/// Attach retry schedule: 250ms * 2^k, bounded attempts.
const ATTACH_BASE_DELAY: Duration = Duration::from_millis(250);
const ATTACH_MAX_ATTEMPTS: u32 = 5;

/// How often (in chunks) the read loop checks the log size threshold.
const ROTATION_CHECK_EVERY: u64 = 100;

pub const SESSION_ENDED_MARKER: &[u8] = b"\n[Session ended]";

/// Events the tracker publishes; the session supervisor owns the receiving
/// loop so the tracker never touches the store.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Output {
        session_id: String,
        at: DateTime<Utc>,
    },
    Nudge {
        session_id: String,
        state: NudgeState,
        summary: Option<String>,
    },
    NudgeCleared {
        session_id: String,
    },
    Ended {
        session_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Detached,
    Attaching,
    Attached,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

struct Inner {
    session_id: String,
    tmux_name: StdMutex<String>,
    tmux: TmuxGateway,
    subscribers: StdMutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    pty: Mutex<Option<PtyHandle>>,
    state: StdMutex<TrackerState>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TrackerEvent>,
    log_path: PathBuf,
    max_log_size: u64,
    rotated_log_size: u64,
    rotation: Mutex<()>,
}

/// Per-session PTY-attached reader: fans the multiplexer's output to any
/// number of bounded subscribers and keeps the on-disk log rotated.
///
/// The subscriber stream is pure live delta; bootstrap is the broadcast
/// plane's job via `capture_pane`.
#[derive(Clone)]
pub struct StreamTracker {
    inner: Arc<Inner>,
}

impl StreamTracker {
    pub fn new(
        session_id: String,
        tmux_name: String,
        tmux: TmuxGateway,
        filtered_sequences: Vec<Vec<u8>>,
        log_path: PathBuf,
        max_log_size: u64,
        rotated_log_size: u64,
        events: mpsc::UnboundedSender<TrackerEvent>,
    ) -> Self {
        let tracker = Self {
            inner: Arc::new(Inner {
                session_id,
                tmux_name: StdMutex::new(tmux_name),
                tmux,
                subscribers: StdMutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                pty: Mutex::new(None),
                state: StdMutex::new(TrackerState::Detached),
                cancel: CancellationToken::new(),
                events,
                log_path,
                max_log_size,
                rotated_log_size,
                rotation: Mutex::new(()),
            }),
        };
        tracker.spawn_read_loop(filtered_sequences);
        tracker
    }

    pub fn state(&self) -> TrackerState {
        *self.inner.state.lock().unwrap()
    }

    pub fn tmux_name(&self) -> String {
        self.inner.tmux_name.lock().unwrap().clone()
    }

    /// Follow a multiplexer session rename; the live attach survives the
    /// rename, this only affects future re-attach and pipe calls.
    pub fn set_tmux_name(&self, name: &str) {
        *self.inner.tmux_name.lock().unwrap() = name.to_string();
    }

    /// Register a subscriber. The returned receiver yields live output
    /// chunks; it is closed when the subscriber falls behind or the session
    /// ends.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|s| s.id != id);
    }

    /// Write user input to the attached PTY. Clearing keys (Enter, Tab,
    /// Shift-Tab) also reset the nudge state. Errors surface to the caller
    /// and do not trigger re-attach.
    pub async fn send_input(&self, bytes: &[u8]) -> Result<()> {
        if input_clears_nudge(bytes) {
            let _ = self.inner.events.send(TrackerEvent::NudgeCleared {
                session_id: self.inner.session_id.clone(),
            });
        }
        let pty = self.inner.pty.lock().await;
        match pty.as_ref() {
            Some(handle) => handle
                .write(bytes)
                .await
                .map_err(|e| SchmuxError::Transient(format!("PTY write: {e}"))),
            None => Err(SchmuxError::Conflict("tracker is not attached".into())),
        }
    }

    /// Resize both the attach PTY and the multiplexer window.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        {
            let pty = self.inner.pty.lock().await;
            if let Some(handle) = pty.as_ref() {
                handle
                    .resize(rows, cols)
                    .await
                    .map_err(|e| SchmuxError::Transient(format!("PTY resize: {e}")))?;
            }
        }
        let name = self.tmux_name();
        self.inner.tmux.resize_window(&name, cols, rows).await
    }

    /// Stop the tracker: cancel the read loop and kill the attach PTY. The
    /// read loop delivers the end-of-session marker and closes subscribers
    /// on its way out.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.pty.lock().await.take() {
            let _ = handle.kill().await;
        }
    }

    fn close_subscribers(&self) {
        self.inner.subscribers.lock().unwrap().clear();
    }

    /// Fan a chunk out to all subscribers. A full or closed queue drops only
    /// that subscriber; dropping its sender closes the channel so the client
    /// knows to reconnect.
    fn deliver(&self, bytes: &[u8]) {
        let targets: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
            let subscribers = self.inner.subscribers.lock().unwrap();
            subscribers.iter().map(|s| (s.id, s.tx.clone())).collect()
        };
        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(bytes.to_vec()).is_err() {
                debug!(
                    "subscriber {id} on session {} lagged, disconnecting",
                    self.inner.session_id
                );
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            self.inner
                .subscribers
                .lock()
                .unwrap()
                .retain(|s| !dead.contains(&s.id));
        }
    }

    fn set_state(&self, state: TrackerState) {
        *self.inner.state.lock().unwrap() = state;
    }

    fn spawn_read_loop(&self, filtered_sequences: Vec<Vec<u8>>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.read_loop(filtered_sequences).await;
        });
    }

    async fn read_loop(self, filtered_sequences: Vec<Vec<u8>>) {
        let inner = &self.inner;
        let mut filter = SeqFilter::new(filtered_sequences);
        let mut nudges = NudgeScanner::new();
        let mut chunk_count = 0u64;

        'attach: loop {
            if inner.cancel.is_cancelled() {
                break;
            }
            self.set_state(TrackerState::Attaching);

            let mut handle = None;
            for attempt in 0..ATTACH_MAX_ATTEMPTS {
                if inner.cancel.is_cancelled() {
                    break 'attach;
                }
                let name = self.tmux_name();
                let (command, args) = inner.tmux.attach_command(&name);
                match spawn_pty(PtyConfig {
                    command,
                    args,
                    ..Default::default()
                }) {
                    Ok(h) => {
                        handle = Some(h);
                        break;
                    }
                    Err(e) => {
                        warn!("attach to {} failed (attempt {}): {e}", name, attempt + 1);
                        tokio::time::sleep(ATTACH_BASE_DELAY * 2u32.pow(attempt)).await;
                    }
                }
            }
            let Some(handle) = handle else {
                warn!("giving up attaching to {}", self.tmux_name());
                break;
            };

            let mut output = handle.subscribe();
            *inner.pty.lock().await = Some(handle);
            self.set_state(TrackerState::Attached);
            info!("attached to {}", self.tmux_name());

            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break 'attach,
                    chunk = output.recv() => match chunk {
                        Ok(chunk) => {
                            let filtered = filter.apply(&chunk.data);
                            if !filtered.is_empty() {
                                self.deliver(&filtered);
                            }
                            for (state, summary) in nudges.scan(&chunk.data) {
                                let _ = inner.events.send(TrackerEvent::Nudge {
                                    session_id: inner.session_id.clone(),
                                    state,
                                    summary,
                                });
                            }
                            let _ = inner.events.send(TrackerEvent::Output {
                                session_id: inner.session_id.clone(),
                                at: Utc::now(),
                            });

                            chunk_count += 1;
                            if chunk_count % ROTATION_CHECK_EVERY == 0 {
                                let tracker = self.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = tracker.maybe_rotate().await {
                                        warn!("log rotation failed: {e}");
                                    }
                                });
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("tracker for {} lagged {n} chunks", self.tmux_name());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            // The attach PTY ended: either the session is gone or the attach
            // itself died. Only the former ends the tracker.
            self.set_state(TrackerState::Detached);
            *inner.pty.lock().await = None;
            match inner.tmux.has_session(&self.tmux_name()).await {
                Ok(true) => {
                    debug!("attach to {} dropped, re-attaching", self.tmux_name());
                    continue;
                }
                _ => break,
            }
        }

        self.set_state(TrackerState::Detached);
        self.deliver(SESSION_ENDED_MARKER);
        self.close_subscribers();
        let _ = inner.events.send(TrackerEvent::Ended {
            session_id: inner.session_id.clone(),
        });
        debug!("tracker for {} finished", self.tmux_name());
    }

    /// Rotate the on-disk log when it outgrows the threshold. Purely a file
    /// operation: the subscriber fan-out never loses bytes over it.
    pub async fn maybe_rotate(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.rotation.lock().await;

        let len = match tokio::fs::metadata(&inner.log_path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if len <= inner.max_log_size {
            return Ok(());
        }
        info!(
            "rotating log for {} ({} bytes)",
            inner.session_id, len
        );

        let name = self.tmux_name();
        inner.tmux.stop_pipe(&name).await?;
        let result = rotate_file(&inner.log_path, inner.rotated_log_size).await;
        // Restart the pipe even if the file operation failed; rotation is
        // retried on the next threshold cross.
        let restart = inner
            .tmux
            .start_pipe(&name, &inner.log_path.to_string_lossy())
            .await;
        result?;
        restart
    }
}

/// Truncate `path` to at most its last `keep` bytes, restarting at the first
/// byte following a newline so the kept tail is a line-aligned suffix.
async fn rotate_file(path: &std::path::Path, keep: u64) -> Result<()> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|e| SchmuxError::Transient(format!("reading log: {e}")))?;
    let offset = rotation_cut(&content, keep as usize);
    let tmp = path.with_extension("log.tmp");
    tokio::fs::write(&tmp, &content[offset..])
        .await
        .map_err(|e| SchmuxError::Transient(format!("writing rotated log: {e}")))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SchmuxError::Transient(format!("renaming rotated log: {e}")))
}

/// Byte offset the rotated log starts at: within the last `keep` bytes, the
/// first position following a `\n` (or the cut point itself if the tail has
/// no newline).
pub fn rotation_cut(content: &[u8], keep: usize) -> usize {
    if content.len() <= keep {
        return 0;
    }
    let start = content.len() - keep;
    match content[start..].iter().position(|&b| b == b'\n') {
        Some(newline) => start + newline + 1,
        None => start,
    }
}

// =============================================================================
// Output filter
// =============================================================================

/// Strips a fixed set of byte sequences from a stream, byte-for-byte, even
/// when a sequence is split across chunk boundaries.
pub struct SeqFilter {
    sequences: Vec<Vec<u8>>,
    carry: Vec<u8>,
}

impl SeqFilter {
    pub fn new(sequences: Vec<Vec<u8>>) -> Self {
        Self {
            sequences,
            carry: Vec::new(),
        }
    }

    /// Filter one chunk. Bytes that could begin a sequence completing in a
    /// later chunk are held back.
    pub fn apply(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        'outer: while i < data.len() {
            for seq in &self.sequences {
                if data[i..].starts_with(seq) {
                    i += seq.len();
                    continue 'outer;
                }
            }
            let rest = &data[i..];
            if self
                .sequences
                .iter()
                .any(|seq| seq.len() > rest.len() && seq.starts_with(rest))
            {
                self.carry = rest.to_vec();
                return out;
            }
            out.push(data[i]);
            i += 1;
        }
        out
    }

    /// Release any held-back partial match (stream end).
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.carry)
    }
}

/// One-shot filter for bootstrap snapshots.
pub fn filter_bytes(sequences: &[Vec<u8>], data: &[u8]) -> Vec<u8> {
    let mut filter = SeqFilter::new(sequences.to_vec());
    let mut out = filter.apply(data);
    out.extend(filter.flush());
    out
}

// =============================================================================
// Registry
// =============================================================================

/// Trackers keyed by session id, plus the per-session rotation locks.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: StdMutex<HashMap<String, StreamTracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: &str, tracker: StreamTracker) {
        self.trackers
            .lock()
            .unwrap()
            .insert(session_id.to_string(), tracker);
    }

    pub fn get(&self, session_id: &str) -> Option<StreamTracker> {
        self.trackers.lock().unwrap().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<StreamTracker> {
        self.trackers.lock().unwrap().remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mouse_seqs() -> Vec<Vec<u8>> {
        vec![
            b"\x1b[?1000h".to_vec(),
            b"\x1b[?1049h".to_vec(),
            b"\x1b[?1049l".to_vec(),
        ]
    }

    #[test]
    fn filter_passes_clean_data() {
        let mut filter = SeqFilter::new(mouse_seqs());
        assert_eq!(filter.apply(b"hello world"), b"hello world");
        assert!(filter.flush().is_empty());
    }

    #[test]
    fn filter_strips_whole_sequence() {
        let mut filter = SeqFilter::new(mouse_seqs());
        let out = filter.apply(b"before\x1b[?1000hafter");
        assert_eq!(out, b"beforeafter");
    }

    #[test]
    fn filter_strips_sequence_split_across_chunks() {
        let mut filter = SeqFilter::new(mouse_seqs());
        let mut out = filter.apply(b"abc\x1b[?10");
        out.extend(filter.apply(b"00hdef"));
        out.extend(filter.flush());
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn filter_split_at_every_boundary() {
        let seq = b"\x1b[?1049h";
        let data = [b"text-".as_slice(), seq, b"-more"].concat();
        for cut in 1..data.len() {
            let mut filter = SeqFilter::new(mouse_seqs());
            let mut out = filter.apply(&data[..cut]);
            out.extend(filter.apply(&data[cut..]));
            out.extend(filter.flush());
            assert_eq!(out, b"text--more", "failed at cut {cut}");
        }
    }

    #[test]
    fn filter_releases_false_prefix() {
        let mut filter = SeqFilter::new(mouse_seqs());
        // Starts like a filtered sequence but diverges.
        let mut out = filter.apply(b"\x1b[?10");
        out.extend(filter.apply(b"99h"));
        out.extend(filter.flush());
        assert_eq!(out, b"\x1b[?1099h");
    }

    #[test]
    fn filter_handles_adjacent_sequences() {
        let mut filter = SeqFilter::new(mouse_seqs());
        let out = filter.apply(b"\x1b[?1000h\x1b[?1049hX");
        assert_eq!(out, b"X");
    }

    #[test]
    fn filter_completeness_on_default_set() {
        let seqs: Vec<Vec<u8>> = crate::config::TerminalConfig::default()
            .filtered_sequences
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        let mut data = Vec::new();
        data.extend_from_slice(b"start ");
        for seq in &seqs {
            data.extend_from_slice(seq);
            data.extend_from_slice(b"mid");
        }
        let out = filter_bytes(&seqs, &data);
        for seq in &seqs {
            assert!(
                !out.windows(seq.len()).any(|w| w == seq.as_slice()),
                "sequence survived filtering"
            );
        }
        assert!(out.starts_with(b"start "));
    }

    #[test]
    fn rotation_cut_noop_when_small() {
        assert_eq!(rotation_cut(b"short", 100), 0);
    }

    #[test]
    fn rotation_cut_lands_after_newline() {
        let content = b"aaaa\nbbbb\ncccc\n";
        let cut = rotation_cut(content, 7);
        assert_eq!(content[cut - 1], b'\n');
        assert_eq!(&content[cut..], b"cccc\n");
        assert!(content.len() - cut <= 7);
    }

    #[test]
    fn rotation_cut_without_newline_in_tail() {
        let content = b"aaaaaaaaaabbbbb";
        let cut = rotation_cut(content, 5);
        assert_eq!(cut, 10);
    }

    #[test]
    fn rotation_result_bounded_by_keep() {
        let mut content = Vec::new();
        for i in 0..1000 {
            content.extend_from_slice(format!("line number {i}\n").as_bytes());
        }
        let keep = 256;
        let cut = rotation_cut(&content, keep);
        let kept = &content[cut..];
        assert!(kept.len() <= keep);
        assert_eq!(content[cut - 1], b'\n');
        assert!(kept.starts_with(b"line number"));
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    fn test_tracker() -> (StreamTracker, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tracker = StreamTracker {
            inner: Arc::new(Inner {
                session_id: "sess-test".to_string(),
                tmux_name: StdMutex::new("schmux-test".to_string()),
                tmux: TmuxGateway::new(Duration::from_secs(1)),
                subscribers: StdMutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                pty: Mutex::new(None),
                state: StdMutex::new(TrackerState::Detached),
                cancel: CancellationToken::new(),
                events,
                log_path: PathBuf::from("/tmp/schmux-test.log"),
                max_log_size: 10 * 1024 * 1024,
                rotated_log_size: 1024 * 1024,
                rotation: Mutex::new(()),
            }),
        };
        (tracker, rx)
    }

    #[tokio::test]
    async fn fanout_reaches_all_subscribers_in_order() {
        let (tracker, _events) = test_tracker();
        assert_eq!(tracker.state(), TrackerState::Detached);
        let (_a_id, mut a) = tracker.subscribe();
        let (_b_id, mut b) = tracker.subscribe();

        tracker.deliver(b"one");
        tracker.deliver(b"two");

        assert_eq!(a.recv().await.unwrap(), b"one");
        assert_eq!(a.recv().await.unwrap(), b"two");
        assert_eq!(b.recv().await.unwrap(), b"one");
        assert_eq!(b.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_alone() {
        let (tracker, _events) = test_tracker();
        let (_slow_id, mut slow) = tracker.subscribe();
        let (_fast_id, mut fast) = tracker.subscribe();

        // Overflow the slow subscriber's queue without draining it.
        for i in 0..(SUBSCRIBER_QUEUE + 2) {
            tracker.deliver(format!("chunk-{i}").as_bytes());
            // Keep the fast one drained.
            let _ = fast.try_recv();
        }

        // Slow receiver drains its backlog then sees the channel closed.
        let mut drained = 0;
        while slow.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, SUBSCRIBER_QUEUE);
        assert!(slow.recv().await.is_none(), "slow subscriber should be closed");

        // The fast subscriber still works.
        tracker.deliver(b"after");
        assert_eq!(fast.recv().await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn session_end_marker_reaches_subscribers() {
        let (tracker, _events) = test_tracker();
        let (_id, mut rx) = tracker.subscribe();
        tracker.deliver(SESSION_ENDED_MARKER);
        assert_eq!(rx.recv().await.unwrap(), b"\n[Session ended]");
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let (tracker, _events) = test_tracker();
        let (id, mut rx) = tracker.subscribe();
        tracker.unsubscribe(id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn input_clear_keys_emit_event() {
        let (tracker, mut events) = test_tracker();
        // Not attached: the write fails, but the clear event fires first.
        let _ = tracker.send_input(b"\r").await;
        match events.recv().await.unwrap() {
            TrackerEvent::NudgeCleared { session_id } => assert_eq!(session_id, "sess-test"),
            other => panic!("expected NudgeCleared, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_input_detached_is_conflict() {
        let (tracker, _events) = test_tracker();
        assert!(matches!(
            tracker.send_input(b"x").await,
            Err(SchmuxError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn rotate_file_keeps_line_aligned_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        let mut content = Vec::new();
        for i in 0..500 {
            content.extend_from_slice(format!("row {i}\n").as_bytes());
        }
        tokio::fs::write(&path, &content).await.unwrap();

        rotate_file(&path, 128).await.unwrap();
        let rotated = tokio::fs::read(&path).await.unwrap();
        assert!(rotated.len() <= 128);
        assert!(rotated.starts_with(b"row "));
        // Suffix property.
        assert_eq!(&content[content.len() - rotated.len()..], &rotated[..]);
        assert!(!path.with_extension("log.tmp").exists());
    }
}
