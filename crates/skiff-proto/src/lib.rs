//! Wire records exchanged with the relay server.
//!
//! Every record is a JSON object with a top-level `type` discriminator.
//! Inbound records are decoded in two steps (raw value, then typed) so the
//! raw command can be journaled verbatim and unknown types can be named in logs.

pub mod command;
pub mod signaling;
pub mod telemetry;

use serde::Serialize;
use serde_json::Value;

pub use command::{AckStatus, CommandAck, CommandEnvelope};
pub use signaling::{IceCandidate, SignalKind, SignalMessage};
pub use telemetry::{BatteryBlock, GpsBlock, PositionSource, TelemetryData, TelemetryFrame};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not a json object")]
    NotAnObject,
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Command { envelope: CommandEnvelope, raw: Value },
    Ping,
    Webrtc(SignalMessage),
    Unknown(String),
}

impl Inbound {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: Value = serde_json::from_str(text)?;
        let kind = match raw.as_object() {
            Some(obj) => obj.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
            None => return Err(DecodeError::NotAnObject),
        };
        match kind.as_str() {
            "command" => {
                let envelope = serde_json::from_value(raw.clone())?;
                Ok(Self::Command { envelope, raw })
            }
            "ping" => Ok(Self::Ping),
            "webrtc" => Ok(Self::Webrtc(serde_json::from_value(raw)?)),
            _ => Ok(Self::Unknown(kind)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Telemetry(TelemetryFrame),
    CommandAck(CommandAck),
    Pong { timestamp: i64 },
    Webrtc(SignalMessage),
}

impl Outbound {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Telemetry(_) => "telemetry",
            Self::CommandAck(_) => "command_ack",
            Self::Pong { .. } => "pong",
            Self::Webrtc(_) => "webrtc",
        }
    }
}
