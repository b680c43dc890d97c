pub mod backoff;
pub mod commands;
pub mod doctor;
pub mod supervisor;
pub mod transport;

use serde::Deserialize;

pub use backoff::{LinkState, ReconnectPolicy};
pub use commands::{CommandDispatcher, DeferredAcks};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorHandle};
pub use transport::{ConnectError, Connector, Link, LinkError, WsConnector};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Relay URL; `{host}`, `{port}` and `{device_id}` are substituted.
    pub server_url: String,
    pub host: String,
    pub port: u16,
    pub device_id: String,
    /// Reconnect when nothing arrives from the relay for this long.
    pub idle_timeout_s: Option<f64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://{host}:{port}/ws/device/{device_id}".into(),
            host: "192.168.1.227".into(),
            port: 8000,
            device_id: "boat-1".into(),
            idle_timeout_s: None,
        }
    }
}

impl LinkConfig {
    pub fn url(&self) -> String {
        self.server_url
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
            .replace("{device_id}", &self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url() {
        assert_eq!(LinkConfig::default().url(), "ws://192.168.1.227:8000/ws/device/boat-1");
    }

    #[test]
    fn template_from_toml() {
        let cfg: LinkConfig = toml::from_str(
            r#"
            server_url = "wss://relay.example.net/boats/{device_id}/link"
            device_id = "skiff-7"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.url(), "wss://relay.example.net/boats/skiff-7/link");
        assert_eq!(cfg.port, 8000);
    }
}
