use anyhow::Result;

use crate::LinkConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    anyhow::ensure!(
        cfg.server_url.contains("{device_id}"),
        "link.server_url must contain {{device_id}}: {}",
        cfg.server_url
    );
    let url = cfg.url();
    anyhow::ensure!(
        url.starts_with("ws://") || url.starts_with("wss://"),
        "link.server_url must be ws:// or wss://, got {}",
        url
    );
    anyhow::ensure!(cfg.port > 0, "link.port must be > 0");
    anyhow::ensure!(
        !cfg.device_id.is_empty()
            && cfg.device_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "link.device_id must be non-empty [A-Za-z0-9._-], got '{}'",
        cfg.device_id
    );
    if let Some(idle) = cfg.idle_timeout_s {
        anyhow::ensure!(idle.is_finite() && idle >= 1.0, "link.idle_timeout_s must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_needs_device_id() {
        check_link(&LinkConfig::default()).unwrap();
        let cfg = LinkConfig { server_url: "ws://{host}:{port}/ws/device".into(), ..Default::default() };
        assert!(check_link(&cfg).is_err());
        let cfg = LinkConfig { server_url: "http://{host}/{device_id}".into(), ..Default::default() };
        assert!(check_link(&cfg).is_err());
        let cfg = LinkConfig { device_id: "boat 1".into(), ..Default::default() };
        assert!(check_link(&cfg).is_err());
    }
}
