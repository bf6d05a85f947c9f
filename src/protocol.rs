//! Wire protocol codec: classifies and parses lines received from a
//! GRBL-family controller, and re-serializes status snapshots for the
//! recognized field set.
//!
//! Status report parsing and the alarm/error code tables are adapted from
//! the GRBL status-line grammar; the classification table mirrors the shape
//! every GRBL/FluidNC/grblHAL banner and response line takes on the wire.

use std::collections::HashMap;
use std::time::Instant;

use thiserror::Error;

/// A 3-axis (plus optional 4th) machine position, in millimeters.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: Option<f64>,
}

impl Position {
    pub const ZERO: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        a: None,
    };

    pub fn sub(&self, other: &Position) -> Position {
        Position {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
            a: match (self.a, other.a) {
                (Some(a), Some(b)) => Some(a - b),
                _ => None,
            },
        }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Parsed machine run state, as carried by the first field of a status report.
#[derive(Clone, Debug, PartialEq)]
pub enum MachineState {
    Idle,
    Run,
    /// Carries the raw `Hold:N` suffix (e.g. `"0"` ready-to-resume, `"1"` holding).
    Hold(String),
    Jog,
    Alarm,
    /// Carries the raw `Door:N` suffix.
    Door(String),
    Check,
    Home,
    Sleep,
    Unknown(String),
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Idle => write!(f, "Idle"),
            MachineState::Run => write!(f, "Run"),
            MachineState::Hold(suffix) => write!(f, "Hold:{suffix}"),
            MachineState::Jog => write!(f, "Jog"),
            MachineState::Alarm => write!(f, "Alarm"),
            MachineState::Door(suffix) => write!(f, "Door:{suffix}"),
            MachineState::Check => write!(f, "Check"),
            MachineState::Home => write!(f, "Home"),
            MachineState::Sleep => write!(f, "Sleep"),
            MachineState::Unknown(s) => write!(f, "{s}"),
        }
    }
}

fn parse_state(raw: &str) -> MachineState {
    let mut parts = raw.splitn(2, ':');
    let name = parts.next().unwrap_or("");
    let suffix = parts.next();
    match name {
        "Idle" => MachineState::Idle,
        "Run" => MachineState::Run,
        "Hold" => MachineState::Hold(suffix.unwrap_or("0").to_string()),
        "Jog" => MachineState::Jog,
        "Alarm" => MachineState::Alarm,
        "Door" => MachineState::Door(suffix.unwrap_or("0").to_string()),
        "Check" => MachineState::Check,
        "Home" => MachineState::Home,
        "Sleep" => MachineState::Sleep,
        other => MachineState::Unknown(other.to_string()),
    }
}

/// Bitset of the input pins a status report's `Pn:` field can carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct PinState {
    pub limit_x: bool,
    pub limit_y: bool,
    pub limit_z: bool,
    pub probe: bool,
    pub door: bool,
    pub hold: bool,
    pub reset: bool,
    pub start: bool,
}

impl PinState {
    fn from_letters(letters: &str) -> PinState {
        let mut pins = PinState::default();
        for c in letters.chars() {
            match c {
                'X' => pins.limit_x = true,
                'Y' => pins.limit_y = true,
                'Z' => pins.limit_z = true,
                'P' => pins.probe = true,
                'D' => pins.door = true,
                'H' => pins.hold = true,
                'R' => pins.reset = true,
                'S' => pins.start = true,
                _ => {}
            }
        }
        pins
    }

    fn to_letters(self) -> String {
        let mut s = String::new();
        if self.limit_x {
            s.push('X');
        }
        if self.limit_y {
            s.push('Y');
        }
        if self.limit_z {
            s.push('Z');
        }
        if self.probe {
            s.push('P');
        }
        if self.door {
            s.push('D');
        }
        if self.hold {
            s.push('H');
        }
        if self.reset {
            s.push('R');
        }
        if self.start {
            s.push('S');
        }
        s
    }

    pub fn any(self) -> bool {
        self != PinState::default()
    }
}

/// Override percentages as last reported by the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct Overrides {
    pub feed: u8,
    pub rapid: u8,
    pub spindle: u8,
}

/// Latest parsed snapshot of a `<...>` status report.
#[derive(Clone, Debug)]
pub struct MachineStatus {
    pub state: MachineState,
    pub machine_pos: Position,
    pub work_pos: Position,
    pub feed_rate: f64,
    pub spindle_speed: f64,
    pub overrides: Overrides,
    pub input_pins: PinState,
    pub last_updated: Instant,
}

impl MachineStatus {
    pub fn idle() -> Self {
        MachineStatus {
            state: MachineState::Idle,
            machine_pos: Position::ZERO,
            work_pos: Position::ZERO,
            feed_rate: 0.0,
            spindle_speed: 0.0,
            overrides: Overrides {
                feed: 100,
                rapid: 100,
                spindle: 100,
            },
            input_pins: PinState::default(),
            last_updated: Instant::now(),
        }
    }

    /// Re-serializes the recognized field set back into a `<...>` status
    /// line. Fields this codec does not track (WCO, individual `F`-only
    /// reports) are never emitted; round-tripping is only guaranteed for
    /// lines built from MPos/WPos/FS/Ov/Pn.
    pub fn to_wire_line(&self) -> String {
        let mut out = format!(
            "<{}|MPos:{}|WPos:{}|FS:{},{}",
            self.state,
            fmt_vec3(&self.machine_pos),
            fmt_vec3(&self.work_pos),
            fmt_num(self.feed_rate),
            fmt_num(self.spindle_speed),
        );
        out.push_str(&format!(
            "|Ov:{},{},{}",
            self.overrides.feed, self.overrides.rapid, self.overrides.spindle
        ));
        if self.input_pins.any() {
            out.push_str(&format!("|Pn:{}", self.input_pins.to_letters()));
        }
        out.push('>');
        out
    }
}

fn fmt_vec3(p: &Position) -> String {
    format!("{:.3},{:.3},{:.3}", p.x, p.y, p.z)
}

fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Errors from parsing a status report or a `$`-settings line.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("not a status report: {0}")]
    NotAStatus(String),
    #[error("invalid position field: {0}")]
    InvalidPosition(String),
    #[error("invalid settings line: {0}")]
    InvalidSettingsLine(String),
}

/// Parses a `<...>` status report line.
pub fn parse_status(line: &str, now: Instant) -> Result<MachineStatus, CodecError> {
    let trimmed = line.trim();
    if !(trimmed.starts_with('<') && trimmed.ends_with('>')) {
        return Err(CodecError::NotAStatus(line.to_string()));
    }
    let inner = &trimmed[1..trimmed.len() - 1];
    let mut fields = inner.split('|');
    let state = parse_state(fields.next().unwrap_or(""));

    let mut machine_pos = Position::ZERO;
    let mut work_pos: Option<Position> = None;
    let mut wco: Option<Position> = None;
    let mut feed_rate = 0.0;
    let mut spindle_speed = 0.0;
    let mut overrides = Overrides {
        feed: 100,
        rapid: 100,
        spindle: 100,
    };
    let mut input_pins = PinState::default();

    for field in fields {
        let mut kv = field.splitn(2, ':');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");
        match key {
            "MPos" => machine_pos = parse_vec3(value)?,
            "WPos" => work_pos = Some(parse_vec3(value)?),
            "WCO" => wco = Some(parse_vec3(value)?),
            "FS" => {
                let mut parts = value.splitn(2, ',');
                feed_rate = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                spindle_speed = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            }
            "F" => feed_rate = value.parse().unwrap_or(0.0),
            "Ov" => {
                let nums: Vec<u8> = value.split(',').filter_map(|s| s.parse().ok()).collect();
                if nums.len() == 3 {
                    overrides = Overrides {
                        feed: nums[0],
                        rapid: nums[1],
                        spindle: nums[2],
                    };
                }
            }
            "Pn" => input_pins = PinState::from_letters(value),
            _ => {} // unrecognized keys are ignored
        }
    }

    let work_pos = match (work_pos, wco) {
        (Some(wp), _) => wp,
        (None, Some(wco)) => machine_pos.sub(&wco),
        (None, None) => machine_pos,
    };

    Ok(MachineStatus {
        state,
        machine_pos,
        work_pos,
        feed_rate,
        spindle_speed,
        overrides,
        input_pins,
        last_updated: now,
    })
}

fn parse_vec3(value: &str) -> Result<Position, CodecError> {
    let nums: Vec<f64> = value
        .split(',')
        .map(|s| s.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| CodecError::InvalidPosition(value.to_string()))?;
    match nums.len() {
        3 => Ok(Position {
            x: nums[0],
            y: nums[1],
            z: nums[2],
            a: None,
        }),
        2 => Ok(Position {
            x: nums[0],
            y: nums[1],
            z: 0.0,
            a: None,
        }),
        4 => Ok(Position {
            x: nums[0],
            y: nums[1],
            z: nums[2],
            a: Some(nums[3]),
        }),
        _ => Err(CodecError::InvalidPosition(value.to_string())),
    }
}

/// Classification of a single line received from the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum LineKind {
    Status,
    Alarm(u8),
    Ok,
    Error(u8),
    Message(String),
    Bracketed(String),
    Banner(String),
    Other,
}

/// Classifies a raw line per the wire grammar, without fully parsing it.
pub fn classify_line(line: &str) -> LineKind {
    let trimmed = line.trim();
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        return LineKind::Status;
    }
    if let Some(rest) = trimmed.strip_prefix("ALARM:") {
        if let Ok(code) = rest.trim().parse() {
            return LineKind::Alarm(code);
        }
    }
    if trimmed == "ok" {
        return LineKind::Ok;
    }
    if let Some(rest) = trimmed.strip_prefix("error:") {
        if let Ok(code) = rest.trim().parse() {
            return LineKind::Error(code);
        }
    }
    if let Some(inner) = trimmed.strip_prefix("[MSG:").and_then(|s| s.strip_suffix(']')) {
        return LineKind::Message(inner.to_string());
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return LineKind::Bracketed(trimmed[1..trimmed.len() - 1].to_string());
    }
    if trimmed.starts_with("Grbl") || trimmed.starts_with("grbl") || trimmed.starts_with("GrblHAL")
    {
        return LineKind::Banner(trimmed.to_string());
    }
    LineKind::Other
}

/// GRBL alarm codes 1..21, with a fallback for anything the table doesn't name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmCode {
    HardLimit,
    SoftLimit,
    AbortCycle,
    ProbeFailInitial,
    ProbeFailContact,
    HomingFailReset,
    HomingFailDoor,
    HomingFailPullOff,
    HomingFailApproach,
    Unknown(u8),
}

impl From<u8> for AlarmCode {
    fn from(code: u8) -> Self {
        match code {
            1 => AlarmCode::HardLimit,
            2 => AlarmCode::SoftLimit,
            3 => AlarmCode::AbortCycle,
            4 => AlarmCode::ProbeFailInitial,
            5 => AlarmCode::ProbeFailContact,
            6 => AlarmCode::HomingFailReset,
            7 => AlarmCode::HomingFailDoor,
            8 => AlarmCode::HomingFailPullOff,
            9 => AlarmCode::HomingFailApproach,
            other => AlarmCode::Unknown(other),
        }
    }
}

pub fn alarm_text(code: u8) -> String {
    match AlarmCode::from(code) {
        AlarmCode::HardLimit => "Hard limit triggered".into(),
        AlarmCode::SoftLimit => "Soft limit alarm".into(),
        AlarmCode::AbortCycle => "Abort during cycle".into(),
        AlarmCode::ProbeFailInitial => "Probe fail: initial state check".into(),
        AlarmCode::ProbeFailContact => "Probe fail: no contact".into(),
        AlarmCode::HomingFailReset => "Homing fail: reset during cycle".into(),
        AlarmCode::HomingFailDoor => "Homing fail: safety door open".into(),
        AlarmCode::HomingFailPullOff => "Homing fail: pull-off failed to clear limit switch".into(),
        AlarmCode::HomingFailApproach => "Homing fail: cycle failed to clear limit switch".into(),
        AlarmCode::Unknown(n) => format!("Unknown alarm (code {n})"),
    }
}

pub fn error_text(code: u8) -> String {
    match code {
        1 => "G-code words consist of a letter and a value; letter was not found".into(),
        2 => "Numeric value format is not valid or missing an expected value".into(),
        3 => "Grbl '$' system command was not recognized or supported".into(),
        4 => "Negative value received for an expected positive value".into(),
        5 => "Homing cycle is not enabled via settings".into(),
        6 => "Minimum step pulse time must be greater than 3usec".into(),
        7 => "EEPROM read failed; reset and restored to default values".into(),
        8 => "Grbl '$' command cannot be used unless Grbl is idle".into(),
        9 => "G-code locked out during alarm or jog state".into(),
        10 => "Soft limits cannot be enabled without homing also enabled".into(),
        11 => "Max characters per line exceeded; line discarded".into(),
        12 => "Grbl '$' setting exceeds the maximum step rate supported".into(),
        13 => "Safety door detected as opened; resuming is disallowed".into(),
        14 => "Build info or startup line exceeded the line buffer length".into(),
        15 => "Jog target exceeds machine travel; ignored".into(),
        16 => "Jog command with no '=' or contains prohibited g-code".into(),
        17 => "Laser mode requires PWM output".into(),
        20 => "Unsupported or invalid g-code command".into(),
        21 => "More than one g-code command from the same modal group in the block".into(),
        22 => "Feed rate has not yet been set or is undefined".into(),
        23 => "G-code command requires an integer value".into(),
        24 => "Two g-code commands that both require the XYZ axis words were detected".into(),
        25 => "Repeated g-code word found in the block".into(),
        26 => "No axis words found for the g-code command".into(),
        27 => "Line number value is invalid".into(),
        28 => "G-code command is missing a required value word".into(),
        29 => "G59.x work coordinate systems are not supported".into(),
        30 => "G53 only allowed with G0/G1 motion modes".into(),
        31 => "Axis words found with no g-code command to use them".into(),
        32 => "G2/G3 arcs need at least one in-plane axis word".into(),
        33 => "Motion command target is invalid".into(),
        34 => "Arc radius value is invalid".into(),
        35 => "G2/G3 arcs need at least one in-plane offset word".into(),
        36 => "Unused value words found in block".into(),
        37 => "G43.1 dynamic tool length offset is not assigned to the configured axis".into(),
        38 => "Tool number greater than the max supported value".into(),
        other => format!("Unknown error (code {other})"),
    }
}

/// A flat view of parsed `$`-settings (`$N=value`), keyed by setting number.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub raw: HashMap<u32, String>,
}

/// Parses a single `$N=value` settings line (not a dump of multiple lines).
pub fn parse_setting_line(line: &str) -> Result<(u32, String), CodecError> {
    let trimmed = line.trim().trim_start_matches('$');
    let mut parts = trimmed.splitn(2, '=');
    let num = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CodecError::InvalidSettingsLine(line.to_string()))?;
    let value = parts
        .next()
        .ok_or_else(|| CodecError::InvalidSettingsLine(line.to_string()))?
        .to_string();
    Ok((num, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_with_wco() {
        let line = "<Hold:0|MPos:1.000,2.000,3.000|WCO:0.5,0.5,0.0|FS:1500,12000|Ov:110,50,100|Pn:XP>";
        let status = parse_status(line, Instant::now()).unwrap();
        assert_eq!(status.state, MachineState::Hold("0".into()));
        assert_eq!(status.machine_pos, Position { x: 1.0, y: 2.0, z: 3.0, a: None });
        assert_eq!(status.work_pos, Position { x: 0.5, y: 1.5, z: 3.0, a: None });
        assert_eq!(status.feed_rate, 1500.0);
        assert_eq!(status.spindle_speed, 12000.0);
        assert_eq!(status.overrides, Overrides { feed: 110, rapid: 50, spindle: 100 });
        assert!(status.input_pins.limit_x);
        assert!(status.input_pins.probe);
        assert!(!status.input_pins.limit_y);
    }

    #[test]
    fn round_trips_mpos_wpos_status() {
        let line = "<Idle|MPos:1.500,2.500,0.000|WPos:1.000,2.000,0.000|FS:800,0|Ov:100,100,100>";
        let status = parse_status(line, Instant::now()).unwrap();
        assert_eq!(status.to_wire_line(), line);
    }

    #[test]
    fn classifies_line_shapes() {
        assert_eq!(classify_line("<Idle|MPos:0,0,0>"), LineKind::Status);
        assert_eq!(classify_line("ok"), LineKind::Ok);
        assert_eq!(classify_line("error:20"), LineKind::Error(20));
        assert_eq!(classify_line("ALARM:1"), LineKind::Alarm(1));
        assert_eq!(
            classify_line("[MSG:Caution: Unlocked]"),
            LineKind::Message("Caution: Unlocked".to_string())
        );
        assert_eq!(
            classify_line("Grbl 1.1h ['$' for help]"),
            LineKind::Banner("Grbl 1.1h ['$' for help]".to_string())
        );
    }

    #[test]
    fn unknown_codes_get_generic_text() {
        assert!(error_text(250).contains("250"));
        assert!(alarm_text(250).contains("250"));
    }

    #[test]
    fn m6_digit_boundary_is_not_a_codec_concern_but_settings_parses() {
        let (num, value) = parse_setting_line("$130=500.000").unwrap();
        assert_eq!(num, 130);
        assert_eq!(value, "500.000");
    }
}
