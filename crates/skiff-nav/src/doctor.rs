use anyhow::Result;
use std::path::Path;

use crate::{CompassConfig, GnssConfig, TelemetryConfig};

pub fn check_telemetry(cfg: &TelemetryConfig) -> Result<()> {
    anyhow::ensure!(
        cfg.interval_s.is_finite() && cfg.interval_s > 0.0,
        "telemetry.interval_s must be > 0, got {}",
        cfg.interval_s
    );
    anyhow::ensure!(cfg.interval_s <= 60.0, "telemetry.interval_s above 60s starves the relay");
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.battery_drain_per_cycle),
        "telemetry.battery_drain_per_cycle should be 0..1"
    );
    Ok(())
}

pub fn check_gnss(cfg: &GnssConfig) -> Result<()> {
    match cfg.source.as_str() {
        "serial" => anyhow::ensure!(cfg.baud > 0, "gnss.baud invalid"),
        "file" => anyhow::ensure!(cfg.nmea_file.is_some(), "gnss.nmea_file missing for source=file"),
        "sim" | "none" => {}
        other => anyhow::bail!("unknown gnss.source: {}", other),
    }
    Ok(())
}

pub fn check_compass(cfg: &CompassConfig) -> Result<()> {
    match cfg.source.as_str() {
        "i2c" => anyhow::ensure!(cfg.address <= 0x7f, "compass.address must be a 7-bit i2c address"),
        "sim" | "none" => {}
        other => anyhow::bail!("unknown compass.source: {}", other),
    }
    anyhow::ensure!(cfg.poll_ms >= 10, "compass.poll_ms too small");
    anyhow::ensure!(cfg.declination_deg.abs() <= 180.0, "compass.declination_deg out of range");
    Ok(())
}

/// Devices the configuration expects but this host lacks. Not fatal: the
/// sensors degrade to "no_gps" / disconnected at runtime.
pub fn missing_devices(gnss: &GnssConfig, compass: &CompassConfig) -> Vec<String> {
    let mut missing = Vec::new();
    match gnss.source.as_str() {
        "serial" if !Path::new(&gnss.serial_dev).exists() => missing.push(format!("gnss serial {}", gnss.serial_dev)),
        "file" => {
            if let Some(p) = gnss.nmea_file.as_deref().filter(|p| !Path::new(p).exists()) {
                missing.push(format!("gnss nmea file {}", p));
            }
        }
        _ => {}
    }
    if compass.source == "i2c" {
        let dev = format!("/dev/i2c-{}", compass.i2c_bus);
        if !Path::new(&dev).exists() {
            missing.push(format!("compass bus {}", dev));
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_telemetry(&TelemetryConfig::default()).unwrap();
        check_gnss(&GnssConfig::default()).unwrap();
        check_compass(&CompassConfig::default()).unwrap();
    }

    #[test]
    fn bad_values_are_reported() {
        let t = TelemetryConfig { interval_s: 0.0, ..Default::default() };
        assert!(check_telemetry(&t).is_err());
        let g = GnssConfig { source: "file".into(), nmea_file: None, ..Default::default() };
        assert!(check_gnss(&g).is_err());
        let c = CompassConfig { source: "spi".into(), ..Default::default() };
        assert!(check_compass(&c).is_err());
    }

    #[test]
    fn absent_devices_are_listed() {
        let g = GnssConfig { serial_dev: "/dev/skiff-no-such-tty".into(), ..Default::default() };
        let c = CompassConfig { i2c_bus: 250, ..Default::default() };
        let missing = missing_devices(&g, &c);
        assert_eq!(missing.len(), 2);
        assert!(missing[0].contains("skiff-no-such-tty"));
    }
}
