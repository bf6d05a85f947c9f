//! Serial TTY transport (feature `serial`).
//!
//! Grounded on the POSIX serial implementation this crate's framing was
//! distilled from: 8N1, no flow control, raw mode, non-blocking reads with a
//! per-call timeout loop. Built on the `serialport` crate rather than raw
//! termios calls so the same code runs on every platform it supports.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{info, warn};

use super::{remaining, take_buffered_line, ByteStream, ConnectionState, TransportError};

pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    device: String,
    read_buf: String,
    state: ConnectionState,
}

impl SerialTransport {
    /// Opens `device` at `baud_rate`. Unknown/unsupported baud rates are
    /// passed through to the platform as-is; callers wanting the historical
    /// "default to 115200" behavior should do so before calling this.
    pub fn open(device: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(device, baud_rate)
            .timeout(Duration::from_millis(20))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| TransportError::Open {
                device: device.to_string(),
                source: std::io::Error::new(ErrorKind::Other, e),
            })?;

        info!(device = %device, baud = baud_rate, "serial port opened");
        Ok(SerialTransport {
            port: Some(port),
            device: device.to_string(),
            read_buf: String::new(),
            state: ConnectionState::Connected,
        })
    }
}

impl ByteStream for SerialTransport {
    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(device = %self.device, "serial port closed");
        }
        self.read_buf.clear();
        self.state = ConnectionState::Closed;
    }

    fn is_open(&self) -> bool {
        self.port.is_some() && self.state == ConnectionState::Connected
    }

    fn write(&mut self, data: &str) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or_else(|| TransportError::Io {
            device: self.device.clone(),
            source: std::io::Error::new(ErrorKind::NotConnected, "not connected"),
        })?;
        port.write_all(data.as_bytes()).map_err(|e| {
            if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) {
                self.state = ConnectionState::Disconnected;
            }
            TransportError::Io {
                device: self.device.clone(),
                source: e,
            }
        })
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or_else(|| TransportError::Io {
            device: self.device.clone(),
            source: std::io::Error::new(ErrorKind::NotConnected, "not connected"),
        })?;
        port.write_all(&[byte]).map_err(|e| {
            if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) {
                self.state = ConnectionState::Disconnected;
            }
            TransportError::Io {
                device: self.device.clone(),
                source: e,
            }
        })
    }

    fn read_line(&mut self, timeout: Duration) -> Option<String> {
        if let Some(line) = take_buffered_line(&mut self.read_buf) {
            return Some(line);
        }
        let port = self.port.as_mut()?;
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let left = remaining(deadline);
            if left.is_zero() {
                return None;
            }
            port.set_timeout(left).ok();
            match port.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => {
                    self.read_buf
                        .push_str(&String::from_utf8_lossy(&buf[..n]));
                    if let Some(line) = take_buffered_line(&mut self.read_buf) {
                        return Some(line);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return None;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(device = %self.device, error = %e, "serial read failed");
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
            }
        }
    }

    fn drain(&mut self) {
        self.read_buf.clear();
        if let Some(port) = self.port.as_mut() {
            port.clear(ClearBuffer::All).ok();
        }
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}

/// Maps a requested baud rate to itself; unsupported values still get passed
/// through to the OS, but callers matching historical behavior can default
/// to 115200 for genuinely unknown/zero values.
pub fn normalize_baud_rate(requested: u32) -> u32 {
    match requested {
        1200 | 2400 | 4800 | 9600 | 19200 | 38400 | 57600 | 115200 | 230400 | 460800
        | 921600 => requested,
        0 => 115_200,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_baud_defaults_to_115200() {
        assert_eq!(normalize_baud_rate(0), 115_200);
    }

    #[test]
    fn known_baud_passes_through() {
        assert_eq!(normalize_baud_rate(9600), 9600);
    }
}
