use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Inbound `command` record. Everything is optional on the wire; validation
/// happens where the command is interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default, deserialize_with = "id_as_string")]
    pub command_id: Option<String>,
    /// None when absent or not a string; the raw record still has it.
    #[serde(default, deserialize_with = "name_as_string")]
    pub command: Option<String>,
    #[serde(default)]
    pub data: Value,
}

// Relays have sent both numeric and string ids.
fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn name_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandAck {
    pub fn accepted(command_id: impl Into<String>, message: Option<String>) -> Self {
        Self { command_id: command_id.into(), status: AckStatus::Accepted, message }
    }

    pub fn rejected(command_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { command_id: command_id.into(), status: AckStatus::Rejected, message: Some(message.into()) }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == AckStatus::Accepted
    }
}
