use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::VideoConfig;

/// A camera claimed for one peer session. Dropping it releases the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

pub trait VideoSourceProvider: Send + Sync {
    fn acquire(&self) -> Result<VideoSource>;
}

/// V4L2 cameras under `/dev`: the configured device if set, otherwise the
/// lowest-numbered `/dev/videoN`.
pub struct V4lCameras {
    cfg: VideoConfig,
    dev_dir: PathBuf,
}

impl V4lCameras {
    pub fn new(cfg: &VideoConfig) -> Self {
        Self::with_dev_dir(cfg, "/dev")
    }

    pub fn with_dev_dir(cfg: &VideoConfig, dev_dir: impl Into<PathBuf>) -> Self {
        Self { cfg: cfg.clone(), dev_dir: dev_dir.into() }
    }
}

impl VideoSourceProvider for V4lCameras {
    fn acquire(&self) -> Result<VideoSource> {
        let device = match &self.cfg.device {
            Some(dev) => {
                let p = PathBuf::from(dev);
                anyhow::ensure!(p.exists(), "configured camera {} not present", p.display());
                p
            }
            None => list_devices(&self.dev_dir)?
                .into_iter()
                .next()
                .map(|(_, p)| p)
                .with_context(|| format!("no video devices under {}", self.dev_dir.display()))?,
        };
        debug!("video: using camera {}", device.display());
        Ok(VideoSource { device, width: self.cfg.width, height: self.cfg.height, fps: self.cfg.fps })
    }
}

/// `videoN` nodes in `dir`, sorted by N.
pub fn list_devices(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(n) = name.to_str().and_then(|s| s.strip_prefix("video")).and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        found.push((n, entry.path()));
    }
    found.sort_by_key(|(n, _)| *n);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_dev(tag: &str, nodes: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("skiff-dev-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for n in nodes {
            std::fs::write(dir.join(n), b"").unwrap();
        }
        dir
    }

    #[test]
    fn picks_lowest_numbered_device() {
        let dir = fake_dev("pick", &["video10", "video2", "videocodec", "null"]);
        let cams = V4lCameras::with_dev_dir(&VideoConfig::default(), &dir);
        let src = cams.acquire().unwrap();
        assert_eq!(src.device, dir.join("video2"));
        assert_eq!((src.width, src.height, src.fps), (640, 480, 30));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn no_devices_is_an_error() {
        let dir = fake_dev("empty", &[]);
        let cams = V4lCameras::with_dev_dir(&VideoConfig::default(), &dir);
        assert!(cams.acquire().is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn configured_device_must_exist() {
        let cfg = VideoConfig { device: Some("/dev/skiff-no-camera".into()), ..VideoConfig::default() };
        assert!(V4lCameras::new(&cfg).acquire().is_err());
    }
}
