use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use skiff_helm::MotorStatus;
use skiff_proto::telemetry::{BatteryBlock, GpsBlock, PositionSource, TelemetryData, TelemetryFrame, SENSOR_DATA};

use crate::compass::CompassReading;
use crate::gnss::GpsReading;
use crate::sensor::{SensorCell, SensorWorker};
use crate::TelemetryConfig;

/// Smoothing weight given to each new heading or speed measurement.
pub const ALPHA: f64 = 0.3;

/// What to do about heading while an attached compass reports disconnected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingFallback {
    /// Use GPS course over ground when there is a fix, else hold.
    #[default]
    GpsCourse,
    /// Keep the last fused heading.
    HoldLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsStatus {
    Fix,
    NoFix,
    NoGps,
}

impl GpsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpsStatus::Fix => "fix",
            GpsStatus::NoFix => "no_fix",
            GpsStatus::NoGps => "no_gps",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub source: PositionSource,
    pub satellites: Option<u32>,
    pub fix_quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Navigation {
    pub heading: Option<f64>,
    /// Knots.
    pub speed: f64,
    pub rudder_deg: f64,
    pub throttle_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleStatus {
    pub battery_pct: f64,
    pub gps_status: GpsStatus,
}

/// One fused snapshot. Never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub sequence: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub position: Position,
    pub navigation: Navigation,
    pub status: SampleStatus,
}

impl TelemetrySample {
    pub fn to_wire(&self) -> TelemetryFrame {
        let nav = &self.navigation;
        TelemetryFrame {
            subtype: SENSOR_DATA.to_string(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            system_time: unix_ms(),
            data: TelemetryData {
                gps: GpsBlock {
                    latitude: self.position.lat,
                    longitude: self.position.lon,
                    heading: nav.heading,
                    speed: nav.speed,
                    satellites: self.position.satellites,
                    fix_quality: self.position.fix_quality,
                    source: self.position.source,
                },
                heading: nav.heading,
                speed: nav.speed,
                battery: BatteryBlock::from_percentage(self.status.battery_pct),
                rudder_position: nav.rudder_deg,
                throttle: nav.throttle_pct,
                status: self.status.gps_status.as_str().to_string(),
            },
        }
    }

    /// Neutral projection for status queries.
    pub fn to_status(&self) -> serde_json::Value {
        serde_json::json!({
            "sequence": self.sequence,
            "timestamp": self.timestamp,
            "position": self.position,
            "navigation": self.navigation,
            "status": self.status,
        })
    }
}

/// Sensor handles the engine reads from. Either may be absent.
#[derive(Default)]
pub struct Sensors {
    pub gps: Option<SensorCell<GpsReading>>,
    pub compass: Option<SensorCell<CompassReading>>,
    pub workers: Vec<SensorWorker>,
}

#[derive(Debug)]
struct Filter {
    heading: Option<f64>,
    speed: Option<f64>,
    lat: Option<f64>,
    lon: Option<f64>,
    battery: f64,
    last: Option<TelemetrySample>,
}

pub struct FusionEngine {
    gps: Option<SensorCell<GpsReading>>,
    compass: Option<SensorCell<CompassReading>>,
    motors: Option<MotorStatus>,
    fallback: HeadingFallback,
    drain: f64,
    filter: Mutex<Filter>,
    sequence: AtomicU64,
    workers: Mutex<Vec<SensorWorker>>,
}

impl FusionEngine {
    pub fn new(sensors: Sensors, motors: Option<MotorStatus>, cfg: &TelemetryConfig) -> Self {
        info!(
            "nav: fusion engine (gps: {}, compass: {}, helm: {}, fallback: {:?})",
            sensors.gps.is_some(),
            sensors.compass.is_some(),
            motors.is_some(),
            cfg.heading_fallback
        );
        Self {
            gps: sensors.gps,
            compass: sensors.compass,
            motors,
            fallback: cfg.heading_fallback,
            drain: cfg.battery_drain_per_cycle.max(0.0),
            filter: Mutex::new(Filter { heading: None, speed: None, lat: None, lon: None, battery: 100.0, last: None }),
            sequence: AtomicU64::new(0),
            workers: Mutex::new(sensors.workers),
        }
    }

    /// Run one fusion cycle and return a sample carrying the current
    /// sequence number. The sequence only advances through [`commit`](Self::commit).
    pub fn next_sample(&self) -> TelemetrySample {
        let gps = self.gps.as_ref().map(SensorCell::snapshot);
        let compass = self.compass.as_ref().map(SensorCell::snapshot);
        let motor = self.motors.as_ref().map(MotorStatus::current).unwrap_or_default();

        let fix = gps.as_ref().filter(|g| g.has_fix());
        let gps_status = match &gps {
            Some(g) if g.has_fix() => GpsStatus::Fix,
            Some(g) if g.running => GpsStatus::NoFix,
            _ => GpsStatus::NoGps,
        };

        let mut f = self.filter.lock().unwrap_or_else(PoisonError::into_inner);

        let course = fix.and_then(|g| g.course);
        let measured = match &compass {
            Some(c) if c.connected => Some(c.heading),
            Some(_) => match self.fallback {
                HeadingFallback::GpsCourse => course,
                HeadingFallback::HoldLast => None,
            },
            None => course,
        };
        if let Some(new) = measured {
            f.heading = Some(match f.heading {
                Some(prev) => blend_heading(prev, new, ALPHA),
                None => new.rem_euclid(360.0),
            });
        }

        if let Some(g) = fix {
            f.lat = g.latitude;
            f.lon = g.longitude;
            if let Some(kn) = g.speed_knots {
                f.speed = Some(match f.speed {
                    Some(prev) => ALPHA * kn + (1.0 - ALPHA) * prev,
                    None => kn,
                });
            }
        }

        f.battery = (f.battery - self.drain).clamp(0.0, 100.0);

        let sample = TelemetrySample {
            sequence: self.sequence.load(Ordering::SeqCst),
            timestamp: unix_ms(),
            position: Position {
                lat: f.lat,
                lon: f.lon,
                source: if fix.is_some() { PositionSource::Gps } else { PositionSource::Unknown },
                satellites: gps.as_ref().and_then(|g| g.satellites),
                fix_quality: gps.as_ref().and_then(|g| g.fix_quality),
            },
            navigation: Navigation {
                heading: f.heading,
                speed: f.speed.unwrap_or(0.0),
                rudder_deg: motor.rudder_deg,
                throttle_pct: motor.throttle_pct,
            },
            status: SampleStatus { battery_pct: f.battery, gps_status },
        };
        f.last = Some(sample.clone());
        sample
    }

    /// Mark `sample` as delivered. Returns false (and changes nothing) if the
    /// sample is stale, so a retried send can never skip a sequence value.
    pub fn commit(&self, sample: &TelemetrySample) -> bool {
        self.sequence
            .compare_exchange(sample.sequence, sample.sequence + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Status projection of the most recent sample, or of the motor state
    /// alone before the first fusion cycle.
    pub fn status(&self) -> serde_json::Value {
        let f = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
        match &f.last {
            Some(s) => s.to_status(),
            None => serde_json::json!({
                "motor": self.motors.as_ref().map(MotorStatus::current).unwrap_or_default(),
            }),
        }
    }

    /// Stop the sensor threads, waiting at most `timeout` for each.
    pub fn stop_sensors(&self, timeout: Duration) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for w in workers {
            let name = w.name().to_string();
            if w.stop(timeout) {
                debug!("nav: {} stopped", name);
            }
        }
    }
}

/// Exponential smoothing on the circle: when the two angles straddle 0°/360°
/// the smaller one is lifted by 360° so the blend takes the short way round.
pub fn blend_heading(prev: f64, new: f64, alpha: f64) -> f64 {
    let (mut p, mut n) = (prev, new);
    if (n - p).abs() > 180.0 {
        if n < p {
            n += 360.0;
        } else {
            p += 360.0;
        }
    }
    (alpha * n + (1.0 - alpha) * p).rem_euclid(360.0)
}

fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
