//! The streaming engine: character-counting flow control, M6 tool-change
//! interception, and ack-driven progression.
//!
//! `StreamState` groups `program`/`sendIndex`/`ackIndex`/`sentLengths`/
//! `bufferUsed`/`held`/`toolChangePending`/`errorCount`/`startTime` as one
//! value behind a single lock, since the invariants relating them cannot be
//! preserved if they are mutated independently.

use std::collections::VecDeque;
use std::time::Instant;

use crate::events::{LineAck, StreamProgress, StreamingError};
use crate::protocol::error_text;

/// Outcome of one send-loop attempt against the current stream state.
pub enum SendOutcome {
    /// No stream running, or the program is exhausted.
    Idle,
    /// Waiting on tool-change acknowledgment; nothing will be sent.
    AwaitingToolChange,
    /// The engine detected `M6`/`M06` on the next line and is now waiting.
    ToolChangeDetected { tool_number: Option<i32> },
    /// A line was written to the transport.
    Sent { line_index: usize, line: String },
    /// The next line doesn't fit in the remaining buffer budget; try later.
    WouldOverflow,
    /// The transport write failed; caller should retry next iteration.
    WriteFailed,
}

/// Outcome of processing one `ok`/`error:N` acknowledgment.
pub enum AckOutcome {
    Acked {
        line_index: usize,
        completed: bool,
    },
    Errored(StreamingError),
}

pub struct StreamState {
    program: Vec<String>,
    send_index: usize,
    ack_index: usize,
    sent_lengths: VecDeque<usize>,
    buffer_used: usize,
    held: bool,
    tool_change_pending: bool,
    error_count: u32,
    start_time: Option<Instant>,
}

impl StreamState {
    pub fn new() -> Self {
        StreamState {
            program: Vec::new(),
            send_index: 0,
            ack_index: 0,
            sent_lengths: VecDeque::new(),
            buffer_used: 0,
            held: false,
            tool_change_pending: false,
            error_count: 0,
            start_time: None,
        }
    }

    /// Resets all streaming bookkeeping for a new program.
    pub fn start(&mut self, lines: Vec<String>) {
        self.program = lines;
        self.send_index = 0;
        self.ack_index = 0;
        self.sent_lengths.clear();
        self.buffer_used = 0;
        self.error_count = 0;
        self.held = false;
        self.tool_change_pending = false;
        self.start_time = Some(Instant::now());
    }

    pub fn clear_in_flight(&mut self) {
        self.sent_lengths.clear();
        self.buffer_used = 0;
    }

    pub fn set_held(&mut self, held: bool) {
        self.held = held;
    }

    pub fn held(&self) -> bool {
        self.held
    }

    pub fn tool_change_pending(&self) -> bool {
        self.tool_change_pending
    }

    /// Advances past the M6 line the engine is currently parked on.
    pub fn acknowledge_tool_change(&mut self) -> bool {
        if self.tool_change_pending {
            self.tool_change_pending = false;
            self.send_index += 1;
            true
        } else {
            false
        }
    }

    pub fn progress(&self) -> StreamProgress {
        StreamProgress {
            total_lines: self.program.len(),
            acked_lines: self.ack_index,
            error_count: self.error_count,
            elapsed_seconds: self
                .start_time
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Attempts to send the next line, honoring the RX buffer budget and
    /// intercepting M6 tool changes. `write` returns `true` on success.
    pub fn try_send_next(
        &mut self,
        rx_buffer_size: usize,
        mut write: impl FnMut(&str) -> bool,
    ) -> SendOutcome {
        if self.tool_change_pending {
            return SendOutcome::AwaitingToolChange;
        }
        if self.send_index >= self.program.len() {
            return SendOutcome::Idle;
        }
        let line = self.program[self.send_index].clone();
        if let Some(tool_number) = detect_tool_change(&line) {
            self.tool_change_pending = true;
            return SendOutcome::ToolChangeDetected { tool_number };
        }

        let line_len = line.len() + 1; // + newline
        if self.buffer_used + line_len > rx_buffer_size {
            return SendOutcome::WouldOverflow;
        }

        if !write(&line) {
            return SendOutcome::WriteFailed;
        }

        self.sent_lengths.push_back(line_len);
        self.buffer_used += line_len;
        let line_index = self.send_index;
        self.send_index += 1;
        SendOutcome::Sent { line_index, line }
    }

    /// Processes a positive `ok` acknowledgment.
    pub fn on_ok(&mut self) -> AckOutcome {
        self.pop_in_flight();
        let line_index = self.ack_index;
        self.ack_index += 1;
        let completed = self.ack_index >= self.program.len();
        AckOutcome::Acked {
            line_index,
            completed,
        }
    }

    /// Processes a negative `error:N` acknowledgment received while streaming.
    /// The caller is responsible for posting a soft reset and setting the
    /// error-state latch; this only builds the event and resets bookkeeping.
    pub fn on_error(&mut self, code: u8) -> AckOutcome {
        let line_index = self.ack_index;
        let failed_line = self.program.get(line_index).cloned();
        let lines_in_flight = self.sent_lengths.len();
        self.error_count += 1;
        self.clear_in_flight();
        self.held = false;
        AckOutcome::Errored(StreamingError {
            line_index,
            error_code: code,
            error_message: error_text(code),
            failed_line,
            lines_in_flight,
        })
    }

    fn pop_in_flight(&mut self) {
        if let Some(len) = self.sent_lengths.pop_front() {
            self.buffer_used -= len;
        }
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ack_into_line_ack(outcome: &AckOutcome) -> LineAck {
    match outcome {
        AckOutcome::Acked { line_index, .. } => LineAck {
            line_index: *line_index,
            ok: true,
        },
        AckOutcome::Errored(err) => LineAck {
            line_index: err.line_index,
            ok: false,
        },
    }
}

/// Detects a whole-token `M6`/`M06` in a G-code line, returning the optional
/// tool number from a following `T<int>` word. Returns `None` if no tool
/// change command is present on this line.
pub fn detect_tool_change(line: &str) -> Option<Option<i32>> {
    let stripped = strip_comments(line).to_uppercase();
    let bytes = stripped.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'M' {
            let (token, next) = if bytes.get(i + 1..i + 3) == Some(b"06") {
                ("M06", i + 3)
            } else if bytes.get(i + 1) == Some(&b'6') {
                ("M6", i + 2)
            } else {
                i += 1;
                continue;
            };
            let _ = token;
            let is_whole_token = bytes.get(next).map_or(true, |c| !c.is_ascii_digit());
            if is_whole_token {
                return Some(parse_tool_number(&stripped));
            }
        }
        i += 1;
    }
    None
}

fn parse_tool_number(line: &str) -> Option<i32> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'T' {
            let mut j = i + 1;
            let mut saw_digit = false;
            let mut negative = false;
            if bytes.get(j) == Some(&b'-') {
                negative = true;
                j += 1;
            }
            let start = j;
            while bytes.get(j).is_some_and(|c| c.is_ascii_digit()) {
                saw_digit = true;
                j += 1;
            }
            if saw_digit {
                let digits = &line[start..j];
                let mut n: i32 = digits.parse().unwrap_or(0);
                if negative {
                    n = -n;
                }
                return Some(n);
            }
        }
        i += 1;
    }
    None
}

/// Strips `(...)` and `;...` comments, as GRBL does before interpreting a line.
pub fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_paren = false;
    for c in line.chars() {
        match c {
            '(' => in_paren = true,
            ')' => in_paren = false,
            ';' if !in_paren => break,
            _ if !in_paren => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_m6_with_tool_number() {
        assert_eq!(detect_tool_change("M6 T2"), Some(Some(2)));
        assert_eq!(detect_tool_change("m06 t5"), Some(Some(5)));
    }

    #[test]
    fn m60_does_not_match_m6() {
        assert_eq!(detect_tool_change("M60"), None);
    }

    #[test]
    fn m6_inside_comment_is_still_detected_after_stripping() {
        assert_eq!(detect_tool_change("(change tool) M6 T1"), Some(Some(1)));
    }

    #[test]
    fn g1_does_not_confuse_m6_scan() {
        assert_eq!(detect_tool_change("G1 X10 Y20"), None);
    }

    #[test]
    fn scenario_s1_buffer_saturation() {
        let mut state = StreamState::new();
        let lines: Vec<String> = (0..20).map(|_| "A".repeat(20)).collect();
        state.start(lines);

        let mut sent = 0;
        loop {
            match state.try_send_next(128, |_| true) {
                SendOutcome::Sent { .. } => sent += 1,
                SendOutcome::WouldOverflow => break,
                _ => break,
            }
        }
        assert_eq!(sent, 6);

        if let AckOutcome::Acked { .. } = state.on_ok() {
            // one more line now fits
        }
        match state.try_send_next(128, |_| true) {
            SendOutcome::Sent { .. } => {}
            _ => panic!("expected exactly one more line to be sendable after one ack"),
        }
        assert!(matches!(
            state.try_send_next(128, |_| true),
            SendOutcome::WouldOverflow
        ));
    }

    #[test]
    fn scenario_s2_mid_stream_error() {
        let mut state = StreamState::new();
        state.start(vec![
            "G1 X10 F500".to_string(),
            "G1 X20".to_string(),
            "BADLINE".to_string(),
            "G1 X30".to_string(),
        ]);
        for _ in 0..4 {
            assert!(matches!(
                state.try_send_next(128, |_| true),
                SendOutcome::Sent { .. }
            ));
        }
        assert!(matches!(state.on_ok(), AckOutcome::Acked { line_index: 0, .. }));
        assert!(matches!(state.on_ok(), AckOutcome::Acked { line_index: 1, .. }));
        match state.on_error(20) {
            AckOutcome::Errored(err) => {
                assert_eq!(err.line_index, 2);
                assert_eq!(err.error_code, 20);
                assert_eq!(err.failed_line.as_deref(), Some("BADLINE"));
            }
            _ => panic!("expected error outcome"),
        }
    }

    #[test]
    fn scenario_s3_tool_change_gates_sendindex() {
        let mut state = StreamState::new();
        state.start(vec![
            "G0 Z5".to_string(),
            "M6 T2".to_string(),
            "G0 X0".to_string(),
        ]);
        assert!(matches!(
            state.try_send_next(128, |_| true),
            SendOutcome::Sent { line_index: 0, .. }
        ));
        state.on_ok();
        match state.try_send_next(128, |_| true) {
            SendOutcome::ToolChangeDetected { tool_number: Some(2) } => {}
            _ => panic!("expected tool change detection"),
        }
        assert!(state.tool_change_pending());
        assert!(state.acknowledge_tool_change());
        assert!(matches!(
            state.try_send_next(128, |_| true),
            SendOutcome::Sent { line_index: 2, .. }
        ));
    }
}
