use crate::models::NudgeState;

/// Marker prefix agents embed in their output to signal status:
/// `ESC ] 9 ; schmux:<state>[;<summary>] BEL`. OSC 9 payloads are invisible
/// to terminal emulators, so the marker needs no stripping.
const MARKER_PREFIX: &[u8] = b"\x1b]9;schmux:";
const MARKER_END: u8 = 0x07;

/// Longest marker worth buffering across chunk boundaries.
const MAX_PENDING: usize = 4096;

/// Key sequences that clear the nudge state when the user types them:
/// Enter, Tab, and Shift-Tab.
pub fn input_clears_nudge(bytes: &[u8]) -> bool {
    bytes.contains(&b'\r') || bytes.contains(&b'\t') || contains_shift_tab(bytes)
}

fn contains_shift_tab(bytes: &[u8]) -> bool {
    bytes.windows(3).any(|w| w == b"\x1b[Z")
}

/// Incremental scanner for nudge markers; tolerates markers split across
/// output chunks by keeping a bounded tail.
#[derive(Default)]
pub struct NudgeScanner {
    pending: Vec<u8>,
}

impl NudgeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every complete marker found.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<(NudgeState, Option<String>)> {
        self.pending.extend_from_slice(chunk);

        let mut found = Vec::new();
        let mut search_from = 0;
        loop {
            let Some(start) = find(&self.pending[search_from..], MARKER_PREFIX)
                .map(|i| i + search_from)
            else {
                break;
            };
            let payload_start = start + MARKER_PREFIX.len();
            let Some(end) = self.pending[payload_start..]
                .iter()
                .position(|&b| b == MARKER_END)
                .map(|i| i + payload_start)
            else {
                // Incomplete marker; keep it pending for the next chunk.
                self.pending.drain(..start);
                self.cap_pending();
                return found;
            };
            if let Some(parsed) = parse_payload(&self.pending[payload_start..end]) {
                found.push(parsed);
            }
            search_from = 0;
            self.pending.drain(..=end);
        }

        // No partial marker in flight: keep only the bytes that could be the
        // start of one.
        let keep = partial_prefix_len(&self.pending, MARKER_PREFIX);
        let cut = self.pending.len() - keep;
        self.pending.drain(..cut);
        self.cap_pending();
        found
    }

    fn cap_pending(&mut self) {
        if self.pending.len() > MAX_PENDING {
            let cut = self.pending.len() - MAX_PENDING;
            self.pending.drain(..cut);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Length of the longest suffix of `data` that is a proper prefix of
/// `prefix`.
fn partial_prefix_len(data: &[u8], prefix: &[u8]) -> usize {
    let max = prefix.len().min(data.len());
    for len in (1..=max).rev() {
        if data[data.len() - len..] == prefix[..len] {
            return len;
        }
    }
    0
}

fn parse_payload(payload: &[u8]) -> Option<(NudgeState, Option<String>)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (state_str, summary) = match text.split_once(';') {
        Some((s, rest)) => (s, Some(rest.to_string()).filter(|r| !r.is_empty())),
        None => (text, None),
    };
    NudgeState::parse(state_str).map(|state| (state, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(payload: &str) -> Vec<u8> {
        let mut bytes = MARKER_PREFIX.to_vec();
        bytes.extend_from_slice(payload.as_bytes());
        bytes.push(MARKER_END);
        bytes
    }

    #[test]
    fn clear_keys_are_enter_tab_shift_tab() {
        assert!(input_clears_nudge(b"\r"));
        assert!(input_clears_nudge(b"\t"));
        assert!(input_clears_nudge(b"\x1b[Z"));
        assert!(input_clears_nudge(b"abc\rdef"));
        // Other keys, including plain escape and newline-free text, do not.
        assert!(!input_clears_nudge(b"abc"));
        assert!(!input_clears_nudge(b"\x1b[A"));
        assert!(!input_clears_nudge(b"\x1b"));
    }

    #[test]
    fn scan_simple_marker() {
        let mut scanner = NudgeScanner::new();
        let mut chunk = b"some output ".to_vec();
        chunk.extend(marker("working"));
        chunk.extend(b" more output");
        let found = scanner.scan(&chunk);
        assert_eq!(found, vec![(NudgeState::Working, None)]);
    }

    #[test]
    fn scan_marker_with_summary() {
        let mut scanner = NudgeScanner::new();
        let found = scanner.scan(&marker("needs_input;waiting for approval"));
        assert_eq!(
            found,
            vec![(
                NudgeState::NeedsInput,
                Some("waiting for approval".to_string())
            )]
        );
    }

    #[test]
    fn scan_marker_split_across_chunks() {
        let mut scanner = NudgeScanner::new();
        let full = marker("completed;all done");
        let (a, b) = full.split_at(7);
        assert!(scanner.scan(a).is_empty());
        let found = scanner.scan(b);
        assert_eq!(
            found,
            vec![(NudgeState::Completed, Some("all done".to_string()))]
        );
    }

    #[test]
    fn scan_marker_split_at_every_boundary() {
        let full = marker("error;boom");
        for cut in 1..full.len() {
            let mut scanner = NudgeScanner::new();
            let mut found = scanner.scan(&full[..cut]);
            found.extend(scanner.scan(&full[cut..]));
            assert_eq!(
                found,
                vec![(NudgeState::Error, Some("boom".to_string()))],
                "failed when split at {cut}"
            );
        }
    }

    #[test]
    fn scan_multiple_markers_in_one_chunk() {
        let mut chunk = marker("working");
        chunk.extend(b"output");
        chunk.extend(marker("completed"));
        let mut scanner = NudgeScanner::new();
        let found = scanner.scan(&chunk);
        assert_eq!(
            found,
            vec![(NudgeState::Working, None), (NudgeState::Completed, None)]
        );
    }

    #[test]
    fn unknown_state_ignored() {
        let mut scanner = NudgeScanner::new();
        assert!(scanner.scan(&marker("sleeping")).is_empty());
    }

    #[test]
    fn plain_output_is_not_buffered_forever() {
        let mut scanner = NudgeScanner::new();
        scanner.scan(&vec![b'x'; 100_000]);
        assert!(scanner.pending.len() <= MAX_PENDING);
    }

    #[test]
    fn other_osc_sequences_pass_unharmed() {
        let mut scanner = NudgeScanner::new();
        assert!(scanner.scan(b"\x1b]0;window title\x07").is_empty());
    }
}
