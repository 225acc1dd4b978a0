//! Pump command definition, serialization and reply decoding
//!
//! Wire format:
//! - Commands are short ASCII codes terminated by `\r`
//! - Replies end with `/`; success replies start with `OK`
//! - Fields are comma separated: `OK,<field>/` or keyed `OK,<key>:<value>/`
//! - A rejected command is answered with exactly `Er/`

use std::fmt;

/// Appended to every command
pub const LINE_ENDING: &str = "\r";
/// Last byte of every reply
pub const TERMINATOR: u8 = b'/';
/// Marker of an accepted command
pub const ACK: &str = "OK";
/// The pump's whole reply when it rejects a command
pub const ERROR_REPLY: &str = "Er/";

/// Lower bound accepted by `uc`
pub const MIN_FLOW_COMPENSATION: f64 = 0.85;
/// Upper bound accepted by `uc`
pub const MAX_FLOW_COMPENSATION: f64 = 1.15;

/// Flowrate resolution assumed until the pump reports its own (mL/min)
pub const DEFAULT_FLOWRATE_RESOLUTION: f64 = 0.01;

/// A pump command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Start pumping
    ///
    /// Command: `ru`
    Run,
    /// Stop pumping
    ///
    /// Command: `st`
    Stop,
    /// Read the head pressure
    ///
    /// Command: `pr`, reply `OK,<psi>/`
    Pressure,
    /// Read pressure and flowrate together
    ///
    /// Command: `cc`, reply `OK,<psi>,<flow>/`
    CurrentConditions,
    /// Read the full pump state
    ///
    /// Command: `cs`, reply `OK,<flow>,<upper>,<lower>,<units>,<running>,.../`
    CurrentState,
    /// Firmware identification
    ///
    /// Command: `id`
    Identify,
    /// Maximum flowrate of the pump head
    ///
    /// Command: `mf`, reply `OK,MF:<mL/min>/`
    MaxFlow,
    /// Pressure units the pump reports in
    ///
    /// Command: `pu`, reply `OK,PU:<units>/`
    PressureUnits,
    /// Maximum rated pressure
    ///
    /// Command: `mp`, reply `OK,MP:<pressure>/`
    MaxPressure,
    /// Flowrate compensation factor, clamped to [0.85, 1.15]
    ///
    /// Command: `uc####`, thousandths
    FlowCompensation(f64),
    /// Set the flowrate in mL/min, encoded in units of the pump's resolution
    ///
    /// Command: `fi####` (`fi#####` on 0.001 mL/min heads)
    SetFlowrate {
        /// Requested flowrate
        ml_per_min: f64,
        /// mL/min per step of the pump head
        resolution: f64,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run => write!(f, "ru"),
            Command::Stop => write!(f, "st"),
            Command::Pressure => write!(f, "pr"),
            Command::CurrentConditions => write!(f, "cc"),
            Command::CurrentState => write!(f, "cs"),
            Command::Identify => write!(f, "id"),
            Command::MaxFlow => write!(f, "mf"),
            Command::PressureUnits => write!(f, "pu"),
            Command::MaxPressure => write!(f, "mp"),
            Command::FlowCompensation(value) => {
                write!(f, "uc{}", encode_flow_compensation(*value))
            }
            Command::SetFlowrate {
                ml_per_min,
                resolution,
            } => write!(f, "fi{}", encode_flowrate(*ml_per_min, *resolution)),
        }
    }
}

/// Clamp a compensation factor into the range the pump accepts.
pub fn clamp_flow_compensation(value: f64) -> f64 {
    if value.is_nan() {
        return 1.0;
    }
    value.clamp(MIN_FLOW_COMPENSATION, MAX_FLOW_COMPENSATION)
}

/// `round(value * 1000)` zero-padded to 4 digits, after clamping.
pub fn encode_flow_compensation(value: f64) -> String {
    let thousandths = (clamp_flow_compensation(value) * 1000.0).round() as u32;
    format!("{:04}", thousandths)
}

/// Flowrate in resolution steps: 4 digits, or 5 for 0.001 mL/min heads.
pub fn encode_flowrate(ml_per_min: f64, resolution: f64) -> String {
    let resolution = if resolution > 0.0 {
        resolution
    } else {
        DEFAULT_FLOWRATE_RESOLUTION
    };
    let steps = (ml_per_min.max(0.0) / resolution).round() as u64;
    if resolution <= 0.001 {
        format!("{:05}", steps)
    } else {
        format!("{:04}", steps)
    }
}

/// True when the pump accepted the command.
pub fn is_ack(response: &str) -> bool {
    response.contains(ACK)
}

/// True when the pump rejected the command.
pub fn is_error(response: &str) -> bool {
    response.contains(ERROR_REPLY)
}

/// Fields after the `OK`, with the terminator stripped from the last one.
pub fn fields(response: &str) -> Vec<&str> {
    let body = response.trim();
    let body = body.strip_suffix(TERMINATOR as char).unwrap_or(body);
    body.split(',')
        .map(str::trim)
        .skip_while(|field| *field == ACK)
        .collect()
}

/// Final field of an `OK,<field>/` reply.
pub fn simple_field(response: &str) -> Option<&str> {
    if !is_ack(response) {
        return None;
    }
    fields(response).last().copied().filter(|f| !f.is_empty())
}

/// `(key, value)` of an `OK,<key>:<value>/` reply.
pub fn keyed_field(response: &str) -> Option<(&str, &str)> {
    let field = simple_field(response)?;
    let (key, value) = field.split_once(':')?;
    Some((key.trim(), value.trim()))
}

/// Value of a reply that may or may not carry a key.
pub fn value_field(response: &str) -> Option<&str> {
    keyed_field(response)
        .map(|(_, value)| value)
        .or_else(|| simple_field(response))
}

/// Pressure from a `pr` reply.
pub fn parse_pressure(response: &str) -> Option<i64> {
    let value: f64 = value_field(response)?.parse().ok()?;
    Some(value.round() as i64)
}

/// `(pressure, flowrate)` from a `cc` reply.
pub fn parse_current_conditions(response: &str) -> Option<(i64, f64)> {
    if !is_ack(response) {
        return None;
    }
    let fields = fields(response);
    let pressure: f64 = fields.first()?.parse().ok()?;
    let flow: f64 = fields.get(1)?.parse().ok()?;
    Some((pressure.round() as i64, flow))
}

/// Flowrate resolution implied by the number of decimals in a flow field.
pub fn resolution_from_field(field: &str) -> Option<f64> {
    let field = field.split_once(':').map_or(field, |(_, v)| v).trim();
    field.parse::<f64>().ok()?;
    let decimals = field.split_once('.').map_or(0, |(_, frac)| frac.len());
    Some(match decimals {
        0 => 1.0,
        1 => 0.1,
        2 => 0.01,
        3 => 0.001,
        n => 10f64.powi(-(n as i32)),
    })
}

/// Flowrate resolution from a `cs` reply (first field is the set flowrate).
pub fn parse_state_resolution(response: &str) -> Option<f64> {
    if !is_ack(response) {
        return None;
    }
    resolution_from_field(fields(response).first()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::Run.to_string(), "ru");
        assert_eq!(Command::Stop.to_string(), "st");
        assert_eq!(Command::Pressure.to_string(), "pr");
        assert_eq!(Command::CurrentState.to_string(), "cs");
        assert_eq!(Command::MaxPressure.to_string(), "mp");
    }

    #[test]
    fn test_flow_compensation_clamped_and_padded() {
        assert_eq!(Command::FlowCompensation(1.0).to_string(), "uc1000");
        assert_eq!(Command::FlowCompensation(0.85).to_string(), "uc0850");
        assert_eq!(Command::FlowCompensation(1.15).to_string(), "uc1150");
        assert_eq!(Command::FlowCompensation(0.5).to_string(), "uc0850");
        assert_eq!(Command::FlowCompensation(2.0).to_string(), "uc1150");
        assert_eq!(Command::FlowCompensation(0.9234).to_string(), "uc0923");
    }

    #[test]
    fn test_flowrate_encoding() {
        let cmd = Command::SetFlowrate {
            ml_per_min: 5.0,
            resolution: 0.01,
        };
        assert_eq!(cmd.to_string(), "fi0500");
        let cmd = Command::SetFlowrate {
            ml_per_min: 5.0,
            resolution: 0.001,
        };
        assert_eq!(cmd.to_string(), "fi05000");
        assert_eq!(encode_flowrate(12.5, 0.1), "0125");
        assert_eq!(encode_flowrate(1.0, 0.0), "0100");
    }

    #[test]
    fn test_terminator_stripped_before_parsing() {
        assert_eq!(simple_field("OK,1234/"), Some("1234"));
        assert_eq!(parse_pressure("OK,1234/"), Some(1234));
        assert_eq!(parse_pressure("OK,0075/\r"), Some(75));
        assert_eq!(parse_pressure("OK/"), None);
        assert_eq!(parse_pressure(""), None);
        assert_eq!(parse_pressure("Er/"), None);
    }

    #[test]
    fn test_keyed_fields() {
        assert_eq!(keyed_field("OK,MF:10.00/"), Some(("MF", "10.00")));
        assert_eq!(keyed_field("OK,PU:PSI/"), Some(("PU", "PSI")));
        assert_eq!(value_field("OK,MP:6000/"), Some("6000"));
        assert_eq!(value_field("OK,6000/"), Some("6000"));
        assert_eq!(keyed_field("OK,1234/"), None);
    }

    #[test]
    fn test_current_conditions() {
        assert_eq!(parse_current_conditions("OK,0152,5.00/"), Some((152, 5.0)));
        assert_eq!(parse_current_conditions("OK,0152/"), None);
    }

    #[test]
    fn test_resolution_probe() {
        assert_eq!(parse_state_resolution("OK,5.00,6000,0,PSI,1,0,0/"), Some(0.01));
        assert_eq!(parse_state_resolution("OK,5.000,6000,0,PSI,1/"), Some(0.001));
        assert_eq!(resolution_from_field("MF:40.0"), Some(0.1));
        assert_eq!(parse_state_resolution("OK,abc/"), None);
    }

    #[test]
    fn test_ack_and_error_markers() {
        assert!(is_ack("OK/"));
        assert!(!is_ack("Er/"));
        assert!(is_error("Er/"));
        assert!(!is_error("OK,12/"));
    }
}
