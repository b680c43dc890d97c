pub mod compass;
pub mod doctor;
pub mod fusion;
pub mod gnss;
pub mod sensor;
pub mod sim;

use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

pub use fusion::{FusionEngine, HeadingFallback, Sensors, TelemetrySample};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds between telemetry frames.
    pub interval_s: f64,
    pub heading_fallback: HeadingFallback,
    /// Battery model: percent lost per fusion cycle.
    pub battery_drain_per_cycle: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { interval_s: 1.0, heading_fallback: HeadingFallback::GpsCourse, battery_drain_per_cycle: 0.01 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    /// "serial", "file" (NMEA replay), "sim" or "none".
    pub source: String,
    pub serial_dev: String,
    pub baud: u32,
    pub nmea_file: Option<String>,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self { source: "serial".into(), serial_dev: "/dev/ttyACM0".into(), baud: 9600, nmea_file: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompassConfig {
    /// "i2c", "sim" or "none".
    pub source: String,
    pub i2c_bus: u32,
    pub address: u16,
    pub offset_x: f64,
    pub offset_y: f64,
    pub declination_deg: f64,
    pub poll_ms: u64,
}

impl Default for CompassConfig {
    fn default() -> Self {
        Self {
            source: "i2c".into(),
            i2c_bus: 1,
            address: 0x13,
            offset_x: 0.0,
            offset_y: 0.0,
            declination_deg: 0.0,
            poll_ms: 100,
        }
    }
}

impl CompassConfig {
    pub fn calibration(&self) -> compass::Calibration {
        compass::Calibration {
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            declination_deg: self.declination_deg,
        }
    }
}

/// Start the configured sensor workers. A source that fails to start is
/// logged and left out; telemetry then runs without it.
pub fn start_sensors(gnss: &GnssConfig, compass_cfg: &CompassConfig, interval: Duration) -> Sensors {
    let mut sensors = Sensors::default();
    let gps_sim = gnss.source == "sim";
    let compass_sim = compass_cfg.source == "sim";
    let boat = (gps_sim || compass_sim).then(sim::shared_boat);

    let gps = match (gnss.source.as_str(), &boat) {
        ("none", _) => None,
        ("sim", Some(b)) => Some(sim::spawn_gps(b.clone(), interval, true)),
        _ => Some(gnss::spawn_reader(gnss)),
    };
    if let Some(started) = gps {
        match started {
            Ok((cell, worker)) => {
                sensors.gps = Some(cell);
                sensors.workers.push(worker);
            }
            Err(e) => warn!("gnss: not started: {:#}", e),
        }
    }

    let compass = match (compass_cfg.source.as_str(), &boat) {
        ("none", _) => None,
        ("sim", Some(b)) => Some(sim::spawn_compass(b.clone(), interval, !gps_sim)),
        _ => Some(compass::spawn_reader(compass_cfg)),
    };
    if let Some(started) = compass {
        match started {
            Ok((cell, worker)) => {
                sensors.compass = Some(cell);
                sensors.workers.push(worker);
            }
            Err(e) => warn!("compass: not started: {:#}", e),
        }
    }

    info!("nav: {} sensor worker(s) running", sensors.workers.len());
    sensors
}

