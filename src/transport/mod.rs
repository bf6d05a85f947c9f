//! Byte-stream transport abstraction shared by serial, TCP, and simulator backends.
//!
//! Every concrete transport implements [`ByteStream`] against the same small
//! capability set: open/close, line-buffered reads with a timeout, raw byte
//! writes, and an explicit connection-state query. Nothing above this layer
//! branches on which concrete transport it is talking to.

#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

use std::time::{Duration, Instant};
use thiserror::Error;

/// Connection state of a transport, as observed by its owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connected,
    Disconnected,
    Error,
}

/// Errors that can occur while opening or operating a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to resolve or connect to {0}")]
    ConnectFailed(String),
    #[error("connect to {0} timed out")]
    ConnectTimedOut(String),
    #[error("io error on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

/// A bidirectional, line-oriented byte pipe to a GRBL-family controller.
///
/// Implementations buffer partial reads internally: a call to [`readLine`](ByteStream::read_line)
/// may return a line assembled entirely from a prior read with no I/O performed.
pub trait ByteStream: Send {
    /// Closes the underlying connection. Idempotent.
    fn close(&mut self);

    /// Whether the transport currently believes it has an open connection.
    fn is_open(&self) -> bool;

    /// Writes a line command, appending no terminator (callers pass an
    /// already newline-terminated string when line framing is required).
    fn write(&mut self, data: &str) -> Result<(), TransportError>;

    /// Writes a single real-time command byte, bypassing any line buffering.
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError>;

    /// Reads the next newline-terminated line, stripping the trailing `\n`
    /// and an optional `\r`. Blocks up to `timeout`, measured against a
    /// monotonic clock, and returns `None` on timeout with no data.
    fn read_line(&mut self, timeout: Duration) -> Option<String>;

    /// Flushes pending output and discards any unread input.
    fn drain(&mut self);

    /// Human-readable device label (path, host:port, or "simulator").
    fn device(&self) -> &str;

    /// Current connection state as last observed by the transport.
    fn connection_state(&self) -> ConnectionState;
}

/// Shared helper: pulls a complete line out of an internal read buffer, if present.
pub(crate) fn take_buffered_line(buf: &mut String) -> Option<String> {
    let nl = buf.find('\n')?;
    let mut line: String = buf.drain(..=nl).collect();
    line.pop(); // trailing \n
    if line.ends_with('\r') {
        line.pop();
    }
    Some(line)
}

/// Shared helper: how much time remains in a deadline, saturating at zero.
pub(crate) fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
