use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use skiff_helm::HelmConfig;
use skiff_link::LinkConfig;
use skiff_nav::{CompassConfig, GnssConfig, TelemetryConfig};
use skiff_video::VideoConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub telemetry: TelemetryConfig,
    pub gnss: GnssConfig,
    pub compass: CompassConfig,
    pub helm: HelmConfig,
    pub video: VideoConfig,
}

/// Defaults, then the TOML file if given, then `SKIFF_*` environment variables.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut cfg = match path {
        Some(p) => {
            let s = std::fs::read_to_string(p).with_context(|| format!("read config {}", p.display()))?;
            toml::from_str(&s).context("parse config toml")?
        }
        None => Config::default(),
    };
    apply_env(&mut cfg, |k| std::env::var(k).ok())?;
    Ok(cfg)
}

pub fn apply_env(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(v) = var("SKIFF_SERVER_URL") {
        cfg.link.server_url = v;
    }
    if let Some(v) = var("SKIFF_SERVER_HOST") {
        cfg.link.host = v;
    }
    if let Some(v) = parsed(&var, "SKIFF_SERVER_PORT")? {
        cfg.link.port = v;
    }
    if let Some(v) = var("SKIFF_DEVICE_ID") {
        cfg.link.device_id = v;
    }
    if let Some(v) = parsed(&var, "SKIFF_TELEMETRY_INTERVAL")? {
        cfg.telemetry.interval_s = v;
    }
    if let Some(v) = parsed(&var, "SKIFF_VIDEO_WIDTH")? {
        cfg.video.width = v;
    }
    if let Some(v) = parsed(&var, "SKIFF_VIDEO_HEIGHT")? {
        cfg.video.height = v;
    }
    if let Some(v) = parsed(&var, "SKIFF_VIDEO_FPS")? {
        cfg.video.fps = v;
    }
    if let Some(v) = parsed(&var, "SKIFF_MAX_RUDDER_ANGLE")? {
        cfg.helm.max_rudder_angle = v;
    }
    Ok(())
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}={:?}: {}", name, raw, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn sections_default_individually() {
        let cfg: Config = toml::from_str(
            r#"
            [link]
            host = "10.0.0.5"

            [helm]
            enable = true
            max_rudder_angle = 30.0

            [gnss]
            source = "sim"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.link.url(), "ws://10.0.0.5:8000/ws/device/boat-1");
        assert!(cfg.helm.enable);
        assert_eq!(cfg.helm.step_size, 2.0);
        assert_eq!(cfg.gnss.source, "sim");
        assert_eq!(cfg.compass.source, "i2c");
        assert_eq!(cfg.telemetry.interval_s, 1.0);
        assert_eq!((cfg.video.width, cfg.video.height, cfg.video.fps), (640, 480, 30));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut cfg = Config::default();
        apply_env(
            &mut cfg,
            env(&[
                ("SKIFF_SERVER_HOST", "relay.local"),
                ("SKIFF_SERVER_PORT", "9000"),
                ("SKIFF_DEVICE_ID", "skiff-3"),
                ("SKIFF_TELEMETRY_INTERVAL", "0.5"),
                ("SKIFF_VIDEO_FPS", " 15 "),
                ("SKIFF_MAX_RUDDER_ANGLE", "60"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.link.url(), "ws://relay.local:9000/ws/device/skiff-3");
        assert_eq!(cfg.telemetry.interval_s, 0.5);
        assert_eq!(cfg.video.fps, 15);
        assert_eq!(cfg.helm.max_rudder_angle, 60.0);
    }

    #[test]
    fn server_url_override_keeps_template() {
        let mut cfg = Config::default();
        apply_env(&mut cfg, env(&[("SKIFF_SERVER_URL", "wss://relay.example.org/d/{device_id}")])).unwrap();
        assert_eq!(cfg.link.url(), "wss://relay.example.org/d/boat-1");
    }

    #[test]
    fn invalid_value_names_the_variable() {
        let mut cfg = Config::default();
        let err = apply_env(&mut cfg, env(&[("SKIFF_VIDEO_WIDTH", "wide")])).unwrap_err();
        assert!(err.to_string().contains("SKIFF_VIDEO_WIDTH"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/skiff.toml"))).is_err());
    }
}
