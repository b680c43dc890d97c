use serde::{Deserialize, Serialize};

pub const SENSOR_DATA: &str = "sensor_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Gps,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub subtype: String,
    pub sequence: u64,
    pub timestamp: i64,
    pub system_time: i64,
    pub data: TelemetryData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    pub gps: GpsBlock,
    pub heading: Option<f64>,
    pub speed: f64,
    pub battery: BatteryBlock,
    pub rudder_position: f64,
    pub throttle: f64,
    /// gps_status: "fix" | "no_fix" | "no_gps"
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsBlock {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed: f64,
    pub satellites: Option<u32>,
    pub fix_quality: Option<u8>,
    pub source: PositionSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryBlock {
    pub percentage: f64,
    // Web clients read `level`
    pub level: f64,
    pub voltage: f64,
}

impl BatteryBlock {
    pub fn from_percentage(pct: f64) -> Self {
        Self {
            percentage: pct,
            level: pct,
            voltage: 12.0 + (pct - 50.0) * 0.04,
        }
    }
}
