//! Callback payloads delivered from the IO thread to the consumer as one
//! tagged message type over a channel, rather than as independently
//! registered closures — this sidesteps capture-lifetime issues and makes
//! delivery order a property of the channel itself.

use crate::protocol::MachineStatus;

/// One acknowledgment (positive or negative) for a transmitted line.
#[derive(Clone, Debug)]
pub struct LineAck {
    pub line_index: usize,
    pub ok: bool,
}

/// Progress snapshot of the currently (or most recently) running stream.
#[derive(Clone, Copy, Debug)]
pub struct StreamProgress {
    pub total_lines: usize,
    pub acked_lines: usize,
    pub error_count: u32,
    pub elapsed_seconds: f64,
}

/// Snapshot captured when a mid-stream `error:N` terminates streaming.
#[derive(Clone, Debug)]
pub struct StreamingError {
    pub line_index: usize,
    pub error_code: u8,
    pub error_message: String,
    pub failed_line: Option<String>,
    pub lines_in_flight: usize,
}

/// Every event the IO thread can post to the consumer mailbox.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    ConnectionChanged { connected: bool, version: String },
    StatusUpdate(MachineStatus),
    RawLine { text: String, sent: bool },
    LineAcked(LineAck),
    ProgressUpdate(StreamProgress),
    Error(String),
    Alarm { code: u8, text: String },
    StreamingError(StreamingError),
    ToolChange { tool_number: Option<i32> },
    SettingChanged { number: u32, value: String },
}
