use serde_json::{Map, Value};

use crate::driver::DriverError;
use crate::THROTTLE_LIMIT_PCT;

/// Longest throttle ramp a command may ask for.
pub const MAX_RAMP_TIME_S: f64 = 10.0;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("command data must be an object")]
    MalformedData,
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("{field} {value} outside [{min}, {max}]")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
    #[error("actuator layer not initialized")]
    NotInitialized,
    #[error("no actuator layer attached")]
    NotAttached,
    #[error("{0}")]
    Driver(#[from] DriverError),
    #[error("stop incomplete: {0}")]
    PartialStop(String),
    #[error("motion cancelled")]
    Cancelled,
}

/// A validated command. Parsing never touches hardware, so a malformed
/// command cannot be partially applied.
#[derive(Debug, Clone, PartialEq)]
pub enum HelmCommand {
    /// position in [-100, 100]; values outside are clamped when applied.
    SetRudder { position: f64 },
    SetThrottle { throttle: f64, ramp_time: Option<f64> },
    Stop,
    EmergencyStop,
    GetStatus,
    SetWaypoints { count: usize },
    Unknown(String),
}

impl HelmCommand {
    pub fn parse(name: Option<&str>, data: &Value) -> Result<Self, CommandError> {
        let empty = Map::new();
        let fields = match data {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(CommandError::MalformedData),
        };

        let cmd = match name.unwrap_or_default() {
            "set_rudder" => HelmCommand::SetRudder { position: number(fields, "position")? },
            "set_throttle" => {
                let throttle = number(fields, "throttle")?;
                if !(-THROTTLE_LIMIT_PCT..=THROTTLE_LIMIT_PCT).contains(&throttle) {
                    return Err(CommandError::OutOfRange {
                        field: "throttle",
                        value: throttle,
                        min: -THROTTLE_LIMIT_PCT,
                        max: THROTTLE_LIMIT_PCT,
                    });
                }
                let ramp_time = optional_number(fields, "ramp_time")?;
                if let Some(r) = ramp_time {
                    if !(0.0..=MAX_RAMP_TIME_S).contains(&r) {
                        return Err(CommandError::OutOfRange { field: "ramp_time", value: r, min: 0.0, max: MAX_RAMP_TIME_S });
                    }
                }
                HelmCommand::SetThrottle { throttle, ramp_time }
            }
            "stop" => HelmCommand::Stop,
            "emergency_stop" => HelmCommand::EmergencyStop,
            "get_status" => HelmCommand::GetStatus,
            "set_waypoint" => HelmCommand::SetWaypoints { count: 1 },
            "set_waypoints" => {
                let count = match fields.get("waypoints") {
                    Some(Value::Array(wps)) => wps.len(),
                    Some(_) => {
                        return Err(CommandError::InvalidField { field: "waypoints", reason: "must be an array".into() })
                    }
                    None => 0,
                };
                HelmCommand::SetWaypoints { count }
            }
            other => HelmCommand::Unknown(other.to_string()),
        };
        Ok(cmd)
    }

    pub fn name(&self) -> &str {
        match self {
            HelmCommand::SetRudder { .. } => "set_rudder",
            HelmCommand::SetThrottle { .. } => "set_throttle",
            HelmCommand::Stop => "stop",
            HelmCommand::EmergencyStop => "emergency_stop",
            HelmCommand::GetStatus => "get_status",
            HelmCommand::SetWaypoints { .. } => "set_waypoints",
            HelmCommand::Unknown(name) => name,
        }
    }

    /// Commands that move actuators and therefore need an attached helm.
    pub fn is_actuating(&self) -> bool {
        matches!(self, HelmCommand::SetRudder { .. } | HelmCommand::SetThrottle { .. } | HelmCommand::Stop)
    }
}

fn number(fields: &Map<String, Value>, field: &'static str) -> Result<f64, CommandError> {
    optional_number(fields, field)?.ok_or(CommandError::MissingField(field))
}

fn optional_number(fields: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, CommandError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(CommandError::InvalidField { field, reason: "is not a finite number".into() }),
        },
        // Some web clients send form values as strings
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(CommandError::InvalidField { field, reason: format!("'{}' is not a number", s) }),
        },
        Some(other) => Err(CommandError::InvalidField { field, reason: format!("expected a number, got {}", other) }),
    }
}
