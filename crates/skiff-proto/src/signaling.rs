use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    RequestOffer,
    Close,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: Option<String>,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// `webrtc` record, both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(default)]
    pub subtype: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boat_id: Option<String>,
    #[serde(default, alias = "client_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignalMessage {
    pub fn new(subtype: SignalKind, boat_id: &str, client_id: &str) -> Self {
        Self {
            subtype,
            boat_id: Some(boat_id.to_string()),
            client_id: Some(client_id.to_string()),
            ..Self::default()
        }
    }

    pub fn offer(boat_id: &str, client_id: &str, sdp: String) -> Self {
        Self { sdp: Some(sdp), ..Self::new(SignalKind::Offer, boat_id, client_id) }
    }

    pub fn answer(boat_id: &str, client_id: &str, sdp: String) -> Self {
        Self {
            sdp: Some(sdp),
            sdp_type: Some("answer".into()),
            ..Self::new(SignalKind::Answer, boat_id, client_id)
        }
    }

    pub fn error(boat_id: &str, client_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(code.to_string()),
            message: Some(message.into()),
            ..Self::new(SignalKind::Error, boat_id, client_id)
        }
    }

    pub fn ice_candidate(boat_id: &str, client_id: &str, candidate: IceCandidate) -> Self {
        Self { candidate: Some(candidate), ..Self::new(SignalKind::IceCandidate, boat_id, client_id) }
    }

    /// Client id with empty strings treated as absent.
    pub fn client(&self) -> Option<&str> {
        self.client_id.as_deref().filter(|c| !c.is_empty())
    }
}
