//! TCP transport (e.g. ESP32-based FluidNC boards exposing a Telnet-style console).
//!
//! Grounded on the POSIX TCP socket implementation this crate's line discipline
//! was distilled from: non-blocking connect with a `poll`-style timeout, Nagle
//! disabled for low-latency real-time bytes, and a monotonic-clock read timeout
//! recomputed from actual elapsed time on every wakeup rather than decremented
//! by a fixed step.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{remaining, take_buffered_line, ByteStream, ConnectionState, TransportError};

pub struct TcpTransport {
    stream: Option<TcpStream>,
    device: String,
    read_buf: String,
    state: ConnectionState,
}

impl TcpTransport {
    /// Connects to `host:port`, failing if the handshake doesn't complete within `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let device = format!("{host}:{port}");
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect_timeout(
            &addr
                .parse()
                .map_err(|_| TransportError::ConnectFailed(device.clone()))?,
            timeout,
        )
        .map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                TransportError::ConnectTimedOut(device.clone())
            } else {
                TransportError::Open {
                    device: device.clone(),
                    source: e,
                }
            }
        })?;

        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(Duration::from_millis(20))).ok();

        info!(device = %device, "tcp connected");
        Ok(TcpTransport {
            stream: Some(stream),
            device,
            read_buf: String::new(),
            state: ConnectionState::Connected,
        })
    }
}

impl ByteStream for TcpTransport {
    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!(device = %self.device, "tcp closed");
        }
        self.read_buf.clear();
        self.state = ConnectionState::Closed;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some() && self.state == ConnectionState::Connected
    }

    fn write(&mut self, data: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or_else(|| TransportError::Io {
            device: self.device.clone(),
            source: std::io::Error::new(ErrorKind::NotConnected, "not connected"),
        })?;
        match stream.write_all(data.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                self.state = ConnectionState::Disconnected;
                Err(TransportError::Io {
                    device: self.device.clone(),
                    source: e,
                })
            }
            Err(e) => Err(TransportError::Io {
                device: self.device.clone(),
                source: e,
            }),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or_else(|| TransportError::Io {
            device: self.device.clone(),
            source: std::io::Error::new(ErrorKind::NotConnected, "not connected"),
        })?;
        match stream.write_all(&[byte]) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                self.state = ConnectionState::Disconnected;
                Err(TransportError::Io {
                    device: self.device.clone(),
                    source: e,
                })
            }
            Err(e) => Err(TransportError::Io {
                device: self.device.clone(),
                source: e,
            }),
        }
    }

    fn read_line(&mut self, timeout: Duration) -> Option<String> {
        if let Some(line) = take_buffered_line(&mut self.read_buf) {
            return Some(line);
        }
        let stream = self.stream.as_mut()?;
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let left = remaining(deadline);
            if left.is_zero() {
                return None;
            }
            stream.set_read_timeout(Some(left)).ok();
            match stream.read(&mut buf) {
                Ok(0) => {
                    info!(device = %self.device, "peer closed connection");
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
                Ok(n) => {
                    self.read_buf
                        .push_str(&String::from_utf8_lossy(&buf[..n]));
                    if let Some(line) = take_buffered_line(&mut self.read_buf) {
                        return Some(line);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(device = %self.device, error = %e, "tcp read failed");
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
            }
        }
    }

    fn drain(&mut self) {
        self.read_buf.clear();
        if let Some(stream) = self.stream.as_mut() {
            stream.set_read_timeout(Some(Duration::from_millis(1))).ok();
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
            debug!(device = %self.device, "tcp drained");
        }
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }
}
