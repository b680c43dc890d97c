pub mod camera;
pub mod codec;
pub mod engine;
pub mod session;

use anyhow::Result;
use serde::Deserialize;

pub use camera::{V4lCameras, VideoSource, VideoSourceProvider};
pub use engine::{IceEmitter, MediaEngine, MediaError, MediaSession, Outbox, SdpKind, UnavailableEngine};
pub use session::{PeerState, SignalingError, VideoSessions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Camera node; the lowest-numbered /dev/videoN when unset.
    pub device: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { width: 640, height: 480, fps: 30, device: None }
    }
}

pub fn check_video(cfg: &VideoConfig) -> Result<()> {
    anyhow::ensure!(
        (16..=4096).contains(&cfg.width) && (16..=4096).contains(&cfg.height),
        "video dimensions {}x{} out of range",
        cfg.width,
        cfg.height
    );
    anyhow::ensure!((1..=120).contains(&cfg.fps), "video.fps must be 1..120, got {}", cfg.fps);
    Ok(())
}
