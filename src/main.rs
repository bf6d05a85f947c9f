//! Demo binary: connects to the built-in simulator, streams a short program,
//! and prints every event until the program completes.

use std::time::Duration;

use cnc_core::events::SessionEvent;
use cnc_core::{Config, ControllerSession};

fn main() {
    tracing_subscriber::fmt::init();

    let mut session = match ControllerSession::connect_simulator(Config::default()) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("failed to start simulator session: {e}");
            return;
        }
    };

    // Wait for the handshake to land before streaming.
    loop {
        match session.recv_event(Duration::from_secs(2)) {
            Some(event) => {
                println!("{event:?}");
                if matches!(event, SessionEvent::ConnectionChanged { connected: true, .. }) {
                    break;
                }
            }
            None => {
                eprintln!("handshake timed out");
                return;
            }
        }
    }

    let program = vec![
        "G21".to_string(),
        "G90".to_string(),
        "G1 X10 Y0 Z0 F500".to_string(),
        "G1 X10 Y10 Z0".to_string(),
        "G1 X0 Y10 Z0".to_string(),
        "G1 X0 Y0 Z0".to_string(),
    ];
    let total = program.len();
    if let Err(e) = session.start_stream(program) {
        eprintln!("failed to start stream: {e}");
        return;
    }

    loop {
        match session.recv_event(Duration::from_secs(5)) {
            Some(event) => {
                println!("{event:?}");
                let progress = session.stream_progress();
                if progress.acked_lines >= total {
                    break;
                }
            }
            None => {
                eprintln!("stream stalled, giving up");
                break;
            }
        }
    }

    session.disconnect();
}
