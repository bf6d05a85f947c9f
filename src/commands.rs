//! Line commands and real-time bytes the controller session can send.
//!
//! `LineCommand` covers everything transmitted as a newline-terminated line;
//! `RealtimeCommand` covers the single-byte commands dispatched out of band.
//! Override percentage-to-byte-sequence encoding is adapted from the
//! reset-then-cascade algorithm used to compute override deltas.

use std::fmt;

/// A line-oriented command, displayed as its exact wire text (no trailing newline).
#[derive(Clone, Debug, PartialEq)]
pub enum LineCommand {
    StatusRequest,
    SettingsDump,
    Home,
    Unlock,
    Jog(String),
    ProbeCycle(String),
    Gcode(String),
    SetWcsZero {
        wcs: u8,
        x: f64,
        y: f64,
        z: f64,
    },
    ActivateWcs(u8),
}

impl fmt::Display for LineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineCommand::StatusRequest => write!(f, "?"),
            LineCommand::SettingsDump => write!(f, "$$"),
            LineCommand::Home => write!(f, "$H"),
            LineCommand::Unlock => write!(f, "$X"),
            LineCommand::Jog(body) => write!(f, "$J={body}"),
            LineCommand::ProbeCycle(body) => write!(f, "{body}"),
            LineCommand::Gcode(body) => write!(f, "{body}"),
            LineCommand::SetWcsZero { wcs, x, y, z } => {
                write!(f, "G10 L20 P{wcs} X{x} Y{y} Z{z}")
            }
            LineCommand::ActivateWcs(n) => {
                let code = match n {
                    1 => "G54".to_string(),
                    2 => "G55".to_string(),
                    3 => "G56".to_string(),
                    4 => "G57".to_string(),
                    5 => "G58".to_string(),
                    6 => "G59".to_string(),
                    other => format!("G59.{}", other.saturating_sub(6)),
                };
                write!(f, "{code}")
            }
        }
    }
}

/// Single-byte real-time commands, dispatched outside the line-command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealtimeByte {
    SoftReset,
    StatusQuery,
    FeedHold,
    CycleStart,
    JogCancel,
    FeedOverride100,
    FeedOverridePlus10,
    FeedOverrideMinus10,
    FeedOverridePlus1,
    FeedOverrideMinus1,
    RapidOverride100,
    RapidOverride50,
    RapidOverride25,
    SpindleOverride100,
    SpindleOverridePlus10,
    SpindleOverrideMinus10,
    SpindleOverridePlus1,
    SpindleOverrideMinus1,
}

impl RealtimeByte {
    pub fn as_byte(self) -> u8 {
        match self {
            RealtimeByte::SoftReset => 0x18,
            RealtimeByte::StatusQuery => b'?',
            RealtimeByte::FeedHold => b'!',
            RealtimeByte::CycleStart => b'~',
            RealtimeByte::JogCancel => 0x85,
            RealtimeByte::FeedOverride100 => 0x90,
            RealtimeByte::FeedOverridePlus10 => 0x91,
            RealtimeByte::FeedOverrideMinus10 => 0x92,
            RealtimeByte::FeedOverridePlus1 => 0x93,
            RealtimeByte::FeedOverrideMinus1 => 0x94,
            RealtimeByte::RapidOverride100 => 0x95,
            RealtimeByte::RapidOverride50 => 0x96,
            RealtimeByte::RapidOverride25 => 0x97,
            RealtimeByte::SpindleOverride100 => 0x99,
            RealtimeByte::SpindleOverridePlus10 => 0x9A,
            RealtimeByte::SpindleOverrideMinus10 => 0x9B,
            RealtimeByte::SpindleOverridePlus1 => 0x9C,
            RealtimeByte::SpindleOverrideMinus1 => 0x9D,
        }
    }
}

/// Encodes a requested feed-override percentage as a reset-then-cascade byte
/// sequence: one reset-to-100% byte, then the minimum run of +-10/+-1 bytes
/// whose sum equals `percent - 100`.
pub fn encode_feed_override(percent: i32) -> Vec<u8> {
    encode_override_cascade(
        percent,
        RealtimeByte::FeedOverride100,
        RealtimeByte::FeedOverridePlus10,
        RealtimeByte::FeedOverrideMinus10,
        RealtimeByte::FeedOverridePlus1,
        RealtimeByte::FeedOverrideMinus1,
    )
}

/// Same cascade, for the spindle override.
pub fn encode_spindle_override(percent: i32) -> Vec<u8> {
    encode_override_cascade(
        percent,
        RealtimeByte::SpindleOverride100,
        RealtimeByte::SpindleOverridePlus10,
        RealtimeByte::SpindleOverrideMinus10,
        RealtimeByte::SpindleOverridePlus1,
        RealtimeByte::SpindleOverrideMinus1,
    )
}

fn encode_override_cascade(
    percent: i32,
    reset: RealtimeByte,
    plus10: RealtimeByte,
    minus10: RealtimeByte,
    plus1: RealtimeByte,
    minus1: RealtimeByte,
) -> Vec<u8> {
    let mut bytes = vec![reset.as_byte()];
    let mut diff = percent - 100;
    while diff >= 10 {
        bytes.push(plus10.as_byte());
        diff -= 10;
    }
    while diff <= -10 {
        bytes.push(minus10.as_byte());
        diff += 10;
    }
    while diff > 0 {
        bytes.push(plus1.as_byte());
        diff -= 1;
    }
    while diff < 0 {
        bytes.push(minus1.as_byte());
        diff += 1;
    }
    bytes
}

/// Rapid override has only three discrete settings, selected by range.
pub fn encode_rapid_override(percent: i32) -> Vec<u8> {
    let byte = if percent <= 25 {
        RealtimeByte::RapidOverride25
    } else if percent <= 50 {
        RealtimeByte::RapidOverride50
    } else {
        RealtimeByte::RapidOverride100
    };
    vec![byte.as_byte()]
}

/// Decodes an override byte sequence back to the signed delta it encodes,
/// for round-trip testing against the invariant that encode/decode is exact.
pub fn decode_override_delta(bytes: &[u8]) -> i32 {
    let mut delta = 0;
    for &b in bytes {
        match b {
            0x90 | 0x99 => delta = 0,
            0x91 | 0x9A => delta += 10,
            0x92 | 0x9B => delta -= 10,
            0x93 | 0x9C => delta += 1,
            0x94 | 0x9D => delta -= 1,
            _ => {}
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_override_145_matches_scenario() {
        let bytes = encode_feed_override(145);
        assert_eq!(
            bytes,
            vec![0x90, 0x91, 0x91, 0x91, 0x91, 0x93, 0x93, 0x93, 0x93, 0x93]
        );
    }

    #[test]
    fn feed_override_85_matches_scenario() {
        let bytes = encode_feed_override(85);
        assert_eq!(bytes, vec![0x90, 0x92, 0x94, 0x94, 0x94, 0x94, 0x94]);
    }

    #[test]
    fn override_round_trips_to_exact_delta() {
        for percent in [100, 145, 85, 110, 55, 200, 10] {
            let bytes = encode_feed_override(percent);
            assert_eq!(decode_override_delta(&bytes), percent - 100);
        }
    }

    #[test]
    fn rapid_override_selects_discrete_byte() {
        assert_eq!(encode_rapid_override(10), vec![0x97]);
        assert_eq!(encode_rapid_override(50), vec![0x96]);
        assert_eq!(encode_rapid_override(100), vec![0x95]);
    }

    #[test]
    fn activate_wcs_formats_g54_through_g59() {
        assert_eq!(LineCommand::ActivateWcs(1).to_string(), "G54");
        assert_eq!(LineCommand::ActivateWcs(6).to_string(), "G59");
    }
}
