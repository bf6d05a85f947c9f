//! Tunables for the session and streaming engine. Constructed explicitly
//! (never read from the environment) since every field here affects
//! safety-relevant timing.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub status_poll_interval_ms: u64,
    pub rx_buffer_size: usize,
    pub max_consecutive_status_timeouts: u32,
    pub handshake_banner_timeout_ms: u64,
    pub handshake_fallback_timeout_ms: u64,
    pub io_loop_read_timeout_ms: u64,
    pub simulator_tick_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            status_poll_interval_ms: 200,
            rx_buffer_size: 128,
            max_consecutive_status_timeouts: 25,
            handshake_banner_timeout_ms: 5_000,
            handshake_fallback_timeout_ms: 2_000,
            io_loop_read_timeout_ms: 20,
            simulator_tick_interval_ms: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_grbl_family_conventions() {
        let cfg = Config::default();
        assert_eq!(cfg.status_poll_interval_ms, 200);
        assert_eq!(cfg.rx_buffer_size, 128);
        assert_eq!(cfg.max_consecutive_status_timeouts, 25);
    }
}
