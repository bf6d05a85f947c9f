//! The controller session: owns the transport, the IO thread, and all
//! streaming state. The consumer thread only ever reaches the session
//! through atomics, the command queues, and the event channel — never by
//! touching the IO thread's state directly.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::commands::{encode_feed_override, encode_rapid_override, encode_spindle_override, RealtimeByte};
use crate::config::Config;
use crate::events::SessionEvent;
use crate::protocol::{classify_line, parse_setting_line, parse_status, LineKind, Settings};
use crate::queues::{
    OverrideQueue, RealtimeMailbox, StringQueue, RT_CYCLE_START, RT_FEED_HOLD, RT_JOG_CANCEL,
    RT_SOFT_RESET,
};
use crate::simulator::SimTransport;
use crate::streaming::{ack_into_line_ack, AckOutcome, SendOutcome, StreamState};
use crate::transport::{ByteStream, ConnectionState, TransportError};

#[cfg(feature = "serial")]
use crate::transport::serial::SerialTransport;
use crate::transport::tcp::TcpTransport;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no compatible controller responded during handshake")]
    HandshakeFailed,
    #[error("a stream cannot be started while the session is in an error state; call acknowledge_error() first")]
    ErrorStateActive,
    #[error("session is not connected")]
    NotConnected,
}

struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    streaming: AtomicBool,
    error_state: AtomicBool,
    error_count: AtomicU32,
    rt_mailbox: RealtimeMailbox,
    strings: StringQueue,
    overrides: OverrideQueue,
    stream: Mutex<StreamState>,
    settings: Mutex<Settings>,
    events_tx: Sender<SessionEvent>,
}

/// A connected (or simulated) session talking to one GRBL-family controller.
pub struct ControllerSession {
    shared: Arc<Shared>,
    io_handle: Option<JoinHandle<()>>,
    events_rx: Receiver<SessionEvent>,
    config: Config,
}

impl ControllerSession {
    /// Connects over a serial port (feature `serial`).
    #[cfg(feature = "serial")]
    pub fn connect_serial(device: &str, baud_rate: u32, config: Config) -> Result<Self, SessionError> {
        let baud_rate = crate::transport::serial::normalize_baud_rate(baud_rate);
        let transport = SerialTransport::open(device, baud_rate)?;
        Self::start_with_transport(Box::new(transport), config)
    }

    /// Connects over TCP (e.g. a network-attached FluidNC board).
    pub fn connect_tcp(host: &str, port: u16, config: Config) -> Result<Self, SessionError> {
        let timeout = Duration::from_millis(config.handshake_banner_timeout_ms);
        let transport = TcpTransport::connect(host, port, timeout)?;
        Self::start_with_transport(Box::new(transport), config)
    }

    /// Connects to the built-in simulator instead of real hardware. The rest
    /// of this type never branches on simulator-vs-real beyond this method.
    pub fn connect_simulator(config: Config) -> Result<Self, SessionError> {
        let transport = SimTransport::connect(
            Duration::from_millis(config.status_poll_interval_ms),
            Duration::from_millis(config.simulator_tick_interval_ms),
        );
        Self::start_with_transport(Box::new(transport), config)
    }

    fn start_with_transport(
        transport: Box<dyn ByteStream>,
        config: Config,
    ) -> Result<Self, SessionError> {
        let (events_tx, events_rx) = unbounded();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            error_state: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            rt_mailbox: RealtimeMailbox::new(),
            strings: StringQueue::new(),
            overrides: OverrideQueue::new(),
            stream: Mutex::new(StreamState::new()),
            settings: Mutex::new(Settings::default()),
            events_tx,
        });

        let io_shared = shared.clone();
        let io_config = config.clone();
        let handle = thread::spawn(move || io_thread_main(io_shared, transport, io_config));

        Ok(ControllerSession {
            shared,
            io_handle: Some(handle),
            events_rx,
            config,
        })
    }

    /// Non-blocking drain of pending consumer-facing events.
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Blocks up to `timeout` for the next event.
    pub fn recv_event(&self, timeout: Duration) -> Option<SessionEvent> {
        self.events_rx.recv_timeout(timeout).ok()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    pub fn is_error_state(&self) -> bool {
        self.shared.error_state.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts streaming `lines`. Refused while `errorState` is latched.
    pub fn start_stream(&self, lines: Vec<String>) -> Result<(), SessionError> {
        if self.shared.error_state.load(Ordering::Acquire) {
            let _ = self.shared.events_tx.send(SessionEvent::Error(
                "cannot start a new stream while the session is in an error state".to_string(),
            ));
            return Err(SessionError::ErrorStateActive);
        }
        let mut stream = self.shared.stream.lock().unwrap();
        stream.start(lines);
        self.shared.streaming.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop_stream(&self) {
        self.shared.streaming.store(false, Ordering::Release);
        self.feed_hold();
    }

    pub fn acknowledge_error(&self) {
        self.shared.error_state.store(false, Ordering::Release);
        info!("error state acknowledged");
    }

    pub fn acknowledge_tool_change(&self) -> bool {
        let mut stream = self.shared.stream.lock().unwrap();
        stream.acknowledge_tool_change()
    }

    pub fn stream_progress(&self) -> crate::events::StreamProgress {
        self.shared.stream.lock().unwrap().progress()
    }

    /// Snapshot of every `$N=value` setting observed so far, e.g. from a
    /// `$$` dump requested via `send_command("$$")`.
    pub fn settings_snapshot(&self) -> Settings {
        self.shared.settings.lock().unwrap().clone()
    }

    pub fn feed_hold(&self) {
        self.shared.rt_mailbox.post(RT_FEED_HOLD);
        self.shared.stream.lock().unwrap().set_held(true);
    }

    pub fn cycle_start(&self) {
        self.shared.rt_mailbox.post(RT_CYCLE_START);
        self.shared.stream.lock().unwrap().set_held(false);
    }

    pub fn soft_reset(&self) {
        self.shared.rt_mailbox.post(RT_SOFT_RESET);
        self.shared.streaming.store(false, Ordering::Release);
        let mut stream = self.shared.stream.lock().unwrap();
        stream.set_held(false);
        stream.clear_in_flight();
    }

    pub fn jog_cancel(&self) {
        self.shared.rt_mailbox.post(RT_JOG_CANCEL);
    }

    pub fn set_feed_override(&self, percent: i32) {
        self.shared.overrides.push(encode_feed_override(percent));
    }

    pub fn set_rapid_override(&self, percent: i32) {
        self.shared.overrides.push(encode_rapid_override(percent));
    }

    pub fn set_spindle_override(&self, percent: i32) {
        self.shared.overrides.push(encode_spindle_override(percent));
    }

    pub fn send_command(&self, text: &str) {
        self.shared.strings.push(text.to_string());
    }

    pub fn unlock(&self) {
        self.send_command("$X");
    }

    /// Stops the IO thread and closes the transport. Idempotent.
    pub fn disconnect(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.io_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn io_thread_main(shared: Arc<Shared>, mut transport: Box<dyn ByteStream>, config: Config) {
    if !handshake(&shared, transport.as_mut(), &config) {
        let _ = shared.events_tx.send(SessionEvent::ConnectionChanged {
            connected: false,
            version: String::new(),
        });
        shared.running.store(false, Ordering::Release);
        return;
    }

    let mut status_pending = false;
    let mut consecutive_timeouts: u32 = 0;
    let mut last_status_poll = Instant::now();
    let read_timeout = Duration::from_millis(config.io_loop_read_timeout_ms);
    let poll_interval = Duration::from_millis(config.status_poll_interval_ms);

    while shared.running.load(Ordering::Acquire) {
        if dispatch_pending_commands(&shared, transport.as_mut()) {
            // Soft reset short-circuits the rest of this iteration.
            continue;
        }

        match transport.read_line(read_timeout) {
            Some(line) => {
                consecutive_timeouts = 0;
                let _ = shared.events_tx.send(SessionEvent::RawLine {
                    text: line.clone(),
                    sent: false,
                });
                process_response(&shared, &line, &mut status_pending);
            }
            None => {
                match transport.connection_state() {
                    ConnectionState::Disconnected | ConnectionState::Error => {
                        handle_disconnect(&shared);
                        break;
                    }
                    _ => {}
                }
                if status_pending {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= config.max_consecutive_status_timeouts {
                        warn!("no status response after {consecutive_timeouts} polls, declaring disconnect");
                        handle_disconnect(&shared);
                        break;
                    }
                }
            }
        }

        if last_status_poll.elapsed() >= poll_interval {
            if transport.write_byte(RealtimeByte::StatusQuery.as_byte()).is_ok() {
                status_pending = true;
            }
            last_status_poll = Instant::now();
        }

        if shared.streaming.load(Ordering::Acquire) {
            drive_send_loop(&shared, transport.as_mut(), config.rx_buffer_size);
        }
    }

    transport.close();
}

fn handshake(shared: &Shared, transport: &mut dyn ByteStream, config: &Config) -> bool {
    transport.drain();
    let _ = transport.write_byte(RealtimeByte::SoftReset.as_byte());
    transport.drain();

    let banner_deadline = Instant::now() + Duration::from_millis(config.handshake_banner_timeout_ms);
    let mut banner: Option<String> = None;
    while Instant::now() < banner_deadline {
        if let Some(line) = transport.read_line(Duration::from_millis(100)) {
            if matches!(classify_line(&line), LineKind::Banner(_)) || line.contains("Grbl") || line.contains("grbl") || line.contains("FluidNC") {
                banner = Some(line);
                break;
            }
        }
    }

    let version = if let Some(banner) = banner {
        firmware_version_from_banner(&banner)
    } else {
        let _ = transport.write("?\n");
        let fallback_deadline =
            Instant::now() + Duration::from_millis(config.handshake_fallback_timeout_ms);
        let mut found = false;
        while Instant::now() < fallback_deadline {
            if let Some(line) = transport.read_line(Duration::from_millis(100)) {
                if line.starts_with('<') && line.len() > 1 {
                    found = true;
                    break;
                }
            }
        }
        if !found {
            return false;
        }
        "FluidNC (compatible)".to_string()
    };

    shared.connected.store(true, Ordering::Release);
    info!(version = %version, "controller handshake complete");
    let _ = shared.events_tx.send(SessionEvent::ConnectionChanged {
        connected: true,
        version,
    });
    true
}

fn firmware_version_from_banner(banner: &str) -> String {
    if banner.contains("FluidNC") {
        "FluidNC".to_string()
    } else if banner.contains("GrblHAL") || banner.contains("grblHAL") {
        "grblHAL".to_string()
    } else {
        banner.trim().to_string()
    }
}

/// Drains and dispatches queued commands in priority order. Returns `true`
/// if a soft reset was dispatched, short-circuiting the rest of the iteration.
fn dispatch_pending_commands(shared: &Shared, transport: &mut dyn ByteStream) -> bool {
    let bits = shared.rt_mailbox.take();
    if bits & RT_SOFT_RESET != 0 {
        let _ = transport.write_byte(RealtimeByte::SoftReset.as_byte());
        transport.drain();
        debug!("soft reset dispatched; skipping remainder of iteration");
        return true;
    }
    if bits & RT_FEED_HOLD != 0 {
        let _ = transport.write_byte(RealtimeByte::FeedHold.as_byte());
    }
    if bits & RT_CYCLE_START != 0 {
        let _ = transport.write_byte(RealtimeByte::CycleStart.as_byte());
    }
    if bits & RT_JOG_CANCEL != 0 {
        let _ = transport.write_byte(RealtimeByte::JogCancel.as_byte());
    }

    for sequence in shared.overrides.drain_all() {
        for byte in sequence {
            let _ = transport.write_byte(byte);
        }
    }

    for line in shared.strings.drain_all() {
        let _ = transport.write(&format!("{line}\n"));
    }

    false
}

fn process_response(shared: &Shared, line: &str, status_pending: &mut bool) {
    match classify_line(line) {
        LineKind::Status => {
            if let Ok(status) = parse_status(line, Instant::now()) {
                *status_pending = false;
                let _ = shared.events_tx.send(SessionEvent::StatusUpdate(status));
            }
        }
        LineKind::Alarm(code) => {
            shared.streaming.store(false, Ordering::Release);
            let _ = shared.events_tx.send(SessionEvent::Alarm {
                code,
                text: crate::protocol::alarm_text(code),
            });
        }
        LineKind::Ok => handle_ack(shared, true, 0),
        LineKind::Error(code) => handle_ack(shared, false, code),
        LineKind::Message(msg) => {
            let _ = shared.events_tx.send(SessionEvent::Error(msg));
        }
        LineKind::Other => {
            if let Ok((number, value)) = parse_setting_line(line) {
                shared
                    .settings
                    .lock()
                    .unwrap()
                    .raw
                    .insert(number, value.clone());
                let _ = shared
                    .events_tx
                    .send(SessionEvent::SettingChanged { number, value });
            }
        }
        LineKind::Bracketed(_) | LineKind::Banner(_) => {}
    }
}

fn handle_ack(shared: &Shared, ok: bool, code: u8) {
    let mut stream = shared.stream.lock().unwrap();
    if ok && !shared.streaming.load(Ordering::Acquire) {
        // A stream was just terminated by an error; in-flight acks for
        // lines already written before the reset must not advance ackIndex.
        drop(stream);
        let _ = shared.events_tx.send(SessionEvent::LineAcked(crate::events::LineAck {
            line_index: 0,
            ok: true,
        }));
        return;
    }
    if ok {
        let outcome = stream.on_ok();
        let line_ack = ack_into_line_ack(&outcome);
        if let AckOutcome::Acked { completed, .. } = outcome {
            if completed {
                shared.streaming.store(false, Ordering::Release);
            }
        }
        drop(stream);
        let _ = shared.events_tx.send(SessionEvent::LineAcked(line_ack));
        let _ = shared
            .events_tx
            .send(SessionEvent::ProgressUpdate(shared.stream.lock().unwrap().progress()));
    } else if shared.streaming.load(Ordering::Acquire) {
        let outcome = stream.on_error(code);
        let line_ack = ack_into_line_ack(&outcome);
        drop(stream);
        shared.rt_mailbox.post(RT_SOFT_RESET);
        shared.streaming.store(false, Ordering::Release);
        shared.error_state.store(true, Ordering::Release);
        shared.error_count.fetch_add(1, Ordering::Relaxed);
        if let AckOutcome::Errored(err) = outcome {
            error!(line = err.line_index, code = err.error_code, "mid-stream error, soft reset queued");
            let _ = shared.events_tx.send(SessionEvent::StreamingError(err));
        }
        let _ = shared.events_tx.send(SessionEvent::LineAcked(line_ack));
    } else {
        let _ = shared.events_tx.send(SessionEvent::LineAcked(crate::events::LineAck {
            line_index: 0,
            ok: false,
        }));
    }
}

fn drive_send_loop(shared: &Shared, transport: &mut dyn ByteStream, rx_buffer_size: usize) {
    let mut stream = shared.stream.lock().unwrap();
    if stream.held() || stream.tool_change_pending() {
        return;
    }
    match stream.try_send_next(rx_buffer_size, |line| transport.write(&format!("{line}\n")).is_ok()) {
        SendOutcome::Sent { line, .. } => {
            drop(stream);
            let _ = shared.events_tx.send(SessionEvent::RawLine { text: line, sent: true });
        }
        SendOutcome::ToolChangeDetected { tool_number } => {
            drop(stream);
            let _ = shared
                .events_tx
                .send(SessionEvent::ToolChange { tool_number });
        }
        SendOutcome::Idle | SendOutcome::AwaitingToolChange | SendOutcome::WouldOverflow | SendOutcome::WriteFailed => {}
    }
}

fn handle_disconnect(shared: &Shared) {
    let was_streaming = shared.streaming.swap(false, Ordering::AcqRel);
    shared.connected.store(false, Ordering::Release);
    {
        let mut stream = shared.stream.lock().unwrap();
        stream.set_held(false);
        stream.clear_in_flight();
    }
    let _ = shared.events_tx.send(SessionEvent::ConnectionChanged {
        connected: false,
        version: String::new(),
    });
    if was_streaming {
        let _ = shared.events_tx.send(SessionEvent::Error(
            "Connection lost during streaming -- job aborted. Manual reconnect required.".to_string(),
        ));
    }
}
