use skiff_proto::{IceCandidate, SignalKind, SignalMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::camera::{VideoSource, VideoSourceProvider};
use crate::codec;
use crate::engine::{IceEmitter, MediaEngine, MediaError, MediaSession, Outbox, SdpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Offering,
    Negotiating,
    Active,
    Closed,
}

/// Negotiation failure for one client. The session is destroyed and the
/// viewer gets a `webrtc/error` carrying [`SignalingError::code`].
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("could not open camera: {0}")]
    Webcam(String),
    #[error("{0}")]
    CodecIncompatible(String),
    #[error("codec negotiation failed: {0}")]
    CodecNegotiation(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

impl SignalingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Webcam(_) => "webcam_initialization_failed",
            Self::CodecIncompatible(_) => "codec_incompatible",
            Self::CodecNegotiation(_) => "codec_negotiation_failed",
            Self::Negotiation(_) => "negotiation_failed",
        }
    }
}

impl From<MediaError> for SignalingError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::Codec(m) => Self::CodecNegotiation(m),
            other => Self::Negotiation(other.to_string()),
        }
    }
}

struct Peer {
    state: PeerState,
    media: Box<dyn MediaSession>,
    // held for the lifetime of the session
    _source: VideoSource,
}

/// Per-client video negotiation. Inbound `webrtc` records go through
/// [`VideoSessions::handle`]; replies are queued on the outbox.
pub struct VideoSessions {
    boat_id: String,
    engine: Arc<dyn MediaEngine>,
    cameras: Arc<dyn VideoSourceProvider>,
    outbox: Outbox,
    peers: HashMap<String, Peer>,
}

impl VideoSessions {
    pub fn new(
        boat_id: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        cameras: Arc<dyn VideoSourceProvider>,
        outbox: Outbox,
    ) -> Self {
        Self { boat_id: boat_id.into(), engine, cameras, outbox, peers: HashMap::new() }
    }

    pub fn state(&self, client: &str) -> Option<PeerState> {
        self.peers.get(client).map(|p| p.state)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub async fn handle(&mut self, msg: SignalMessage) {
        let Some(client) = msg.client().map(str::to_string) else {
            warn!("video: {:?} without client id dropped", msg.subtype);
            return;
        };
        match msg.subtype {
            SignalKind::RequestOffer => self.request_offer(&client).await,
            SignalKind::Offer => self.offer(&client, msg.sdp).await,
            SignalKind::Answer => self.answer(&client, msg.sdp).await,
            SignalKind::IceCandidate => self.ice(&client, msg.candidate).await,
            SignalKind::Close => {
                self.close(&client).await;
            }
            SignalKind::Error => warn!(
                "video: viewer {} reported {}: {}",
                client,
                msg.error.as_deref().unwrap_or("error"),
                msg.message.as_deref().unwrap_or("")
            ),
            SignalKind::Unknown => debug!("video: unknown signaling subtype from {}", client),
        }
    }

    /// Viewer asks the boat to start: open a session and send our offer.
    pub async fn request_offer(&mut self, client: &str) {
        if let Err(e) = self.try_request_offer(client).await {
            self.fail(client, e).await;
        }
    }

    async fn try_request_offer(&mut self, client: &str) -> Result<(), SignalingError> {
        self.open_peer(client, PeerState::Offering).await?;
        let sdp = self.peer_mut(client)?.media.create_offer().await?;
        self.send(SignalMessage::offer(&self.boat_id, client, sdp));
        info!("video: offer sent to {}", client);
        Ok(())
    }

    /// Viewer-initiated negotiation: check codecs, answer, wait for ICE.
    pub async fn offer(&mut self, client: &str, sdp: Option<String>) {
        if let Err(e) = self.try_offer(client, sdp).await {
            self.fail(client, e).await;
        }
    }

    async fn try_offer(&mut self, client: &str, sdp: Option<String>) -> Result<(), SignalingError> {
        let sdp = sdp
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SignalingError::Negotiation("offer without sdp".into()))?;
        self.open_peer(client, PeerState::Negotiating).await?;

        let compat = codec::check(&sdp);
        if !compat.compatible {
            return Err(SignalingError::CodecIncompatible(compat.message));
        }
        debug!("video: {}: {}", client, compat.message);

        let peer = self.peer_mut(client)?;
        peer.media.apply_remote(sdp, SdpKind::Offer).await?;
        let answer = peer.media.create_answer().await?;
        self.send(SignalMessage::answer(&self.boat_id, client, answer));
        info!("video: answer sent to {}", client);
        Ok(())
    }

    /// Viewer's answer to our offer.
    pub async fn answer(&mut self, client: &str, sdp: Option<String>) {
        let Some(peer) = self.peers.get_mut(client) else {
            warn!("video: answer from {} without a session dropped", client);
            return;
        };
        let Some(sdp) = sdp.filter(|s| !s.trim().is_empty()) else {
            self.fail(client, SignalingError::Negotiation("answer without sdp".into())).await;
            return;
        };
        match peer.media.apply_remote(sdp, SdpKind::Answer).await {
            Ok(()) => {
                peer.state = PeerState::Active;
                info!("video: session with {} active", client);
            }
            Err(e) => self.fail(client, e.into()).await,
        }
    }

    pub async fn ice(&mut self, client: &str, candidate: Option<IceCandidate>) {
        let Some(peer) = self.peers.get_mut(client) else {
            warn!("video: ICE candidate from {} without a session dropped", client);
            return;
        };
        let Some(candidate) = candidate.filter(|c| c.candidate.as_deref().is_some_and(|s| !s.is_empty())) else {
            warn!("video: incomplete ICE candidate from {} dropped", client);
            return;
        };
        match peer.media.add_ice_candidate(candidate).await {
            Ok(()) => debug!("video: remote ICE candidate added for {}", client),
            Err(e) => warn!("video: ICE candidate for {} rejected: {}", client, e),
        }
    }

    /// Destroy one client's session. Returns whether one existed.
    pub async fn close(&mut self, client: &str) -> bool {
        let Some(mut peer) = self.peers.remove(client) else {
            return false;
        };
        peer.state = PeerState::Closed;
        peer.media.close().await;
        info!("video: session with {} closed", client);
        true
    }

    pub async fn close_all(&mut self) -> usize {
        let clients: Vec<String> = self.peers.keys().cloned().collect();
        let mut closed = 0;
        for client in clients {
            if self.close(&client).await {
                closed += 1;
            }
        }
        closed
    }

    async fn open_peer(&mut self, client: &str, state: PeerState) -> Result<(), SignalingError> {
        if self.close(client).await {
            debug!("video: replaced existing session for {}", client);
        }
        let source = self.cameras.acquire().map_err(|e| SignalingError::Webcam(format!("{:#}", e)))?;
        let ice = IceEmitter::new(&self.boat_id, client, self.outbox.clone());
        let media = self.engine.open_session(client, source.clone(), ice).await?;
        self.peers.insert(client.to_string(), Peer { state, media, _source: source });
        Ok(())
    }

    fn peer_mut(&mut self, client: &str) -> Result<&mut Peer, SignalingError> {
        self.peers
            .get_mut(client)
            .ok_or_else(|| SignalingError::Negotiation(format!("no session for {}", client)))
    }

    async fn fail(&mut self, client: &str, err: SignalingError) {
        warn!("video: {} for {}: {}", err.code(), client, err);
        self.close(client).await;
        self.send(SignalMessage::error(&self.boat_id, client, err.code(), err.to_string()));
    }

    fn send(&self, msg: SignalMessage) {
        if self.outbox.send(msg).is_err() {
            debug!("video: outbox closed, signaling reply dropped");
        }
    }
}
