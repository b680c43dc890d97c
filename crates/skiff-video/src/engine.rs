use futures_util::future::BoxFuture;
use skiff_proto::{IceCandidate, SignalMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::camera::VideoSource;

/// Signaling records waiting to be written to the link.
pub type Outbox = mpsc::UnboundedSender<SignalMessage>;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media engine unavailable: {0}")]
    Unavailable(String),
    #[error("codec negotiation: {0}")]
    Codec(String),
    #[error("{0}")]
    Negotiation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Peer-connection and codec machinery. The state machine only sees SDP text
/// and ICE candidates going in and out.
pub trait MediaEngine: Send + Sync {
    fn name(&self) -> &str;

    /// New peer connection with a video track reading from `source`.
    /// Local ICE candidates are reported through `ice`.
    fn open_session(
        &self,
        client_id: &str,
        source: VideoSource,
        ice: IceEmitter,
    ) -> BoxFuture<'_, Result<Box<dyn MediaSession>, MediaError>>;
}

pub trait MediaSession: Send {
    fn create_offer(&mut self) -> BoxFuture<'_, Result<String, MediaError>>;
    fn apply_remote(&mut self, sdp: String, kind: SdpKind) -> BoxFuture<'_, Result<(), MediaError>>;
    fn create_answer(&mut self) -> BoxFuture<'_, Result<String, MediaError>>;
    fn add_ice_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), MediaError>>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Engine used when no media stack is built in; every session fails with a
/// structured error to the viewer.
pub struct UnavailableEngine;

impl MediaEngine for UnavailableEngine {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn open_session(
        &self,
        _client_id: &str,
        _source: VideoSource,
        _ice: IceEmitter,
    ) -> BoxFuture<'_, Result<Box<dyn MediaSession>, MediaError>> {
        Box::pin(async { Err(MediaError::Unavailable("no media engine in this build".into())) })
    }
}

/// Sends local ICE candidates for one client to the outbox.
#[derive(Clone)]
pub struct IceEmitter {
    boat_id: String,
    client_id: String,
    outbox: Outbox,
}

impl IceEmitter {
    pub(crate) fn new(boat_id: &str, client_id: &str, outbox: Outbox) -> Self {
        Self { boat_id: boat_id.to_string(), client_id: client_id.to_string(), outbox }
    }

    /// Candidates without a candidate string are skipped; a missing sdpMid
    /// becomes "" and a missing sdpMLineIndex 0. Returns whether one was queued.
    pub fn emit(&self, mut c: IceCandidate) -> bool {
        if c.candidate.as_deref().map_or(true, str::is_empty) {
            warn!("video: skipping local ICE candidate without candidate string");
            return false;
        }
        c.sdp_mid.get_or_insert_with(String::new);
        c.sdp_m_line_index.get_or_insert(0);
        let queued = self.outbox.send(SignalMessage::ice_candidate(&self.boat_id, &self.client_id, c)).is_ok();
        if queued {
            debug!("video: local ICE candidate queued for {}", self.client_id);
        }
        queued
    }
}
