//! Scrollback buffer and escape-sequence scanner.
//!
//! The reader loop appends every PTY chunk to a bounded ring buffer while a
//! small state machine watches the byte stream for the two sequences the
//! multiplexer cares about: alternate-screen enter/exit (`ESC[?1049h/l`)
//! and OSC 0 window titles (`ESC]0;<title>BEL`). Offsets are absolute so
//! the TUI-entry marker survives ring trimming.

const FORMFEED: u8 = 0x0c;

/// Cap on an in-flight escape sequence; anything longer is treated as
/// ordinary output (protects against malicious unterminated OSC).
const MAX_SEQUENCE: usize = 4096;

// ---------------------------------------------------------------------------
// ReplayBuffer
// ---------------------------------------------------------------------------

pub struct ReplayBuffer {
    data: Vec<u8>,
    /// Absolute stream offset of `data[0]`.
    start_offset: u64,
    max: usize,
    /// Absolute offset at which the child entered the alternate screen.
    tui_entry: Option<u64>,
    alt_screen_active: bool,
}

impl ReplayBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            data: Vec::new(),
            start_offset: 0,
            max,
            tui_entry: None,
            alt_screen_active: false,
        }
    }

    /// Absolute offset one past the last buffered byte.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.data.len() as u64
    }

    pub fn alt_screen_active(&self) -> bool {
        self.alt_screen_active
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.max {
            let excess = self.data.len() - self.max;
            self.data.drain(..excess);
            self.start_offset += excess as u64;
            // A marker trimmed off the front clamps to the window start.
            if let Some(entry) = self.tui_entry {
                if entry < self.start_offset {
                    self.tui_entry = Some(self.start_offset);
                }
            }
        }
    }

    pub fn enter_alt_screen(&mut self, at: u64) {
        self.alt_screen_active = true;
        self.tui_entry = Some(at);
    }

    pub fn exit_alt_screen(&mut self) {
        self.alt_screen_active = false;
        self.tui_entry = None;
    }

    /// Bytes to send a newly attached sink. While the child is in the
    /// alternate screen, only the pre-TUI scrollback is replayed, followed
    /// by a single formfeed so the TUI repaints itself; otherwise the whole
    /// buffer.
    pub fn replay(&self) -> Vec<u8> {
        match (self.alt_screen_active, self.tui_entry) {
            (true, Some(entry)) => {
                let cut = (entry.saturating_sub(self.start_offset)) as usize;
                let cut = cut.min(self.data.len());
                let mut out = self.data[..cut].to_vec();
                out.push(FORMFEED);
                out
            }
            _ => self.data.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AnsiScanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Alternate screen entered; the offset is the position of the ESC byte
    /// so replay excludes the sequence itself.
    AltScreenEnter(u64),
    AltScreenExit,
    Title(String),
}

enum ScanState {
    Ground,
    Escape,
    Csi,
    Osc,
    /// Saw ESC inside an OSC; the next byte decides ST vs. a new sequence.
    OscEscape,
}

/// Incremental scanner; sequences may be split across chunk boundaries.
pub struct AnsiScanner {
    state: ScanState,
    seq: Vec<u8>,
    seq_start: u64,
}

impl AnsiScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Ground,
            seq: Vec::new(),
            seq_start: 0,
        }
    }

    /// Feed a chunk whose first byte sits at absolute offset `base`.
    pub fn scan(&mut self, base: u64, chunk: &[u8]) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        for (i, &byte) in chunk.iter().enumerate() {
            let offset = base + i as u64;
            match self.state {
                ScanState::Ground => {
                    if byte == 0x1b {
                        self.state = ScanState::Escape;
                        self.seq.clear();
                        self.seq_start = offset;
                    }
                }
                ScanState::Escape => match byte {
                    b'[' => self.state = ScanState::Csi,
                    b']' => self.state = ScanState::Osc,
                    0x1b => {
                        self.seq_start = offset;
                    }
                    _ => self.state = ScanState::Ground,
                },
                ScanState::Csi => {
                    // Final bytes of a CSI sequence are 0x40..=0x7e.
                    if (0x40..=0x7e).contains(&byte) {
                        self.seq.push(byte);
                        match self.seq.as_slice() {
                            b"?1049h" => events.push(ScanEvent::AltScreenEnter(self.seq_start)),
                            b"?1049l" => events.push(ScanEvent::AltScreenExit),
                            _ => {}
                        }
                        self.state = ScanState::Ground;
                    } else {
                        self.seq.push(byte);
                        if self.seq.len() > MAX_SEQUENCE {
                            self.state = ScanState::Ground;
                        }
                    }
                }
                ScanState::Osc => match byte {
                    0x07 => {
                        self.finish_osc(&mut events);
                        self.state = ScanState::Ground;
                    }
                    0x1b => self.state = ScanState::OscEscape,
                    _ => {
                        self.seq.push(byte);
                        if self.seq.len() > MAX_SEQUENCE {
                            self.state = ScanState::Ground;
                        }
                    }
                },
                ScanState::OscEscape => {
                    if byte == b'\\' {
                        self.finish_osc(&mut events);
                    }
                    self.state = ScanState::Ground;
                }
            }
        }
        events
    }

    fn finish_osc(&mut self, events: &mut Vec<ScanEvent>) {
        let body = std::mem::take(&mut self.seq);
        if let Some(title) = body.strip_prefix(b"0;") {
            let title = String::from_utf8_lossy(title).trim().to_string();
            if !title.is_empty() {
                events.push(ScanEvent::Title(title));
            }
        }
    }
}

impl Default for AnsiScanner {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replay_whole_buffer_outside_tui() {
        let mut buffer = ReplayBuffer::new(64);
        buffer.push(b"hello world");
        assert_eq!(buffer.replay(), b"hello world");
    }

    #[test]
    fn test_replay_truncates_at_tui_entry() {
        let mut buffer = ReplayBuffer::new(1024);
        buffer.push(b"ordinary output");
        let entry = buffer.end_offset();
        buffer.enter_alt_screen(entry);
        buffer.push(b"\x1b[?1049h");
        buffer.push(b"TUI FRAME CONTENT");

        let replay = buffer.replay();
        assert_eq!(&replay[..15], b"ordinary output");
        assert_eq!(replay[15], 0x0c);
        assert_eq!(replay.len(), 16, "TUI frame must not be replayed");
    }

    #[test]
    fn test_replay_full_again_after_alt_exit() {
        let mut buffer = ReplayBuffer::new(1024);
        buffer.push(b"before");
        buffer.enter_alt_screen(buffer.end_offset());
        buffer.push(b"tui");
        buffer.exit_alt_screen();
        buffer.push(b"after");
        assert_eq!(buffer.replay(), b"beforetuiafter");
    }

    #[test]
    fn test_ring_trims_head_and_clamps_marker() {
        let mut buffer = ReplayBuffer::new(8);
        buffer.push(b"0123");
        buffer.enter_alt_screen(2);
        buffer.push(b"456789ab");
        assert_eq!(buffer.end_offset(), 12);
        // Window is the last 8 bytes; the marker clamped to its start.
        let replay = buffer.replay();
        assert_eq!(replay, vec![0x0c]);
    }

    #[test]
    fn test_scanner_finds_alt_screen_enter_offset() {
        let mut scanner = AnsiScanner::new();
        let events = scanner.scan(100, b"abc\x1b[?1049hdef");
        assert_eq!(events, vec![ScanEvent::AltScreenEnter(103)]);
    }

    #[test]
    fn test_scanner_handles_split_sequences() {
        let mut scanner = AnsiScanner::new();
        assert!(scanner.scan(0, b"out\x1b[?10").is_empty());
        let events = scanner.scan(8, b"49h");
        assert_eq!(events, vec![ScanEvent::AltScreenEnter(3)]);
    }

    #[test]
    fn test_scanner_extracts_osc0_title() {
        let mut scanner = AnsiScanner::new();
        let events = scanner.scan(0, b"\x1b]0;Implement login flow\x07rest");
        assert_eq!(
            events,
            vec![ScanEvent::Title("Implement login flow".to_string())]
        );
    }

    #[test]
    fn test_scanner_accepts_st_terminator() {
        let mut scanner = AnsiScanner::new();
        let events = scanner.scan(0, b"\x1b]0;hello\x1b\\");
        assert_eq!(events, vec![ScanEvent::Title("hello".to_string())]);
    }

    #[test]
    fn test_scanner_ignores_other_osc_codes() {
        let mut scanner = AnsiScanner::new();
        let events = scanner.scan(0, b"\x1b]2;not this one\x07");
        assert!(events.is_empty());
    }

    #[test]
    fn test_scanner_split_title_across_three_chunks() {
        let mut scanner = AnsiScanner::new();
        assert!(scanner.scan(0, b"\x1b]0;Im").is_empty());
        assert!(scanner.scan(6, b"plement").is_empty());
        let events = scanner.scan(13, b" login\x07");
        assert_eq!(events, vec![ScanEvent::Title("Implement login".to_string())]);
    }

    #[test]
    fn test_bracketed_paste_passes_through_unmatched() {
        let mut scanner = AnsiScanner::new();
        let events = scanner.scan(0, b"\x1b[200~pasted text\x1b[201~");
        assert!(events.is_empty());
    }
}
