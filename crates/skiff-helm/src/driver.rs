use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::HelmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Rudder,
    Thrust,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Rudder => f.write_str("rudder"),
            Channel::Thrust => f.write_str("throttle"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{channel} output rejected value {value}")]
    OutOfRange { channel: Channel, value: f64 },
    #[error("pwm write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Hardware(String),
}

/// Pulse-width output for the rudder servo and the thrust ESC.
///
/// `value` is normalized to [-1, 1] with 0 as neutral; the electrical
/// encoding (pulse widths, duty cycles) is the driver's business.
pub trait ActuatorDriver: Send {
    fn set_angle(&mut self, channel: Channel, value: f64) -> Result<(), DriverError>;

    /// Stop generating pulses. Called once the outputs are neutral.
    fn shutdown(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Linear pulse mapping: -1 -> min_us, 0 -> center, +1 -> max_us.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseRange {
    pub min_us: f64,
    pub max_us: f64,
}

impl PulseRange {
    /// 270° servo: 500µs at -135°, 1500µs center, 2500µs at +135°.
    pub const SERVO_270: PulseRange = PulseRange { min_us: 500.0, max_us: 2500.0 };
    /// Bidirectional ESC: 1000µs full reverse, 1500µs neutral, 2000µs full forward.
    pub const ESC_BIDIR: PulseRange = PulseRange { min_us: 1000.0, max_us: 2000.0 };

    pub fn pulse_us(&self, value: f64) -> f64 {
        let center = (self.min_us + self.max_us) / 2.0;
        let half = (self.max_us - self.min_us) / 2.0;
        (center + value.clamp(-1.0, 1.0) * half).clamp(self.min_us, self.max_us)
    }
}

struct PwmOutput {
    dir: PathBuf,
    pulse: PulseRange,
}

/// Linux hardware PWM through `/sys/class/pwm`.
pub struct SysfsPwm {
    period_ns: u64,
    rudder: PwmOutput,
    thrust: PwmOutput,
}

impl SysfsPwm {
    pub fn open(cfg: &HelmConfig) -> Result<Self> {
        Self::open_at(Path::new("/sys/class/pwm"), cfg)
    }

    pub fn open_at(root: &Path, cfg: &HelmConfig) -> Result<Self> {
        anyhow::ensure!(cfg.frequency_hz > 0, "helm.frequency_hz must be > 0");
        let chip = root.join(format!("pwmchip{}", cfg.pwm_chip));
        anyhow::ensure!(chip.is_dir(), "pwm chip not found: {}", chip.display());

        let period_ns = 1_000_000_000u64 / cfg.frequency_hz as u64;
        let rudder = PwmOutput { dir: export(&chip, cfg.rudder_channel)?, pulse: PulseRange::SERVO_270 };
        let thrust = PwmOutput { dir: export(&chip, cfg.thrust_channel)?, pulse: PulseRange::ESC_BIDIR };

        let pwm = Self { period_ns, rudder, thrust };
        for out in [&pwm.rudder, &pwm.thrust] {
            write_attr(&out.dir, "period", pwm.period_ns)?;
            write_attr(&out.dir, "duty_cycle", pwm.duty_ns(out, 0.0))?;
            write_attr(&out.dir, "enable", 1)?;
        }
        info!(
            "helm: sysfs pwm ready on {} (rudder ch{}, thrust ch{}, {} Hz)",
            chip.display(), cfg.rudder_channel, cfg.thrust_channel, cfg.frequency_hz
        );
        Ok(pwm)
    }

    fn duty_ns(&self, out: &PwmOutput, value: f64) -> u64 {
        (out.pulse.pulse_us(value) * 1000.0).round() as u64
    }

    fn output(&self, channel: Channel) -> &PwmOutput {
        match channel {
            Channel::Rudder => &self.rudder,
            Channel::Thrust => &self.thrust,
        }
    }
}

impl ActuatorDriver for SysfsPwm {
    fn set_angle(&mut self, channel: Channel, value: f64) -> Result<(), DriverError> {
        if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
            return Err(DriverError::OutOfRange { channel, value });
        }
        let out = self.output(channel);
        let duty = self.duty_ns(out, value);
        debug!("helm: {} duty {} ns", channel, duty);
        write_attr(&out.dir, "duty_cycle", duty).map_err(|e| DriverError::Hardware(format!("{:#}", e)))
    }

    fn shutdown(&mut self) -> Result<(), DriverError> {
        for out in [&self.rudder, &self.thrust] {
            write_attr(&out.dir, "enable", 0).map_err(|e| DriverError::Hardware(format!("{:#}", e)))?;
        }
        Ok(())
    }
}

fn export(chip: &Path, channel: u32) -> Result<PathBuf> {
    let dir = chip.join(format!("pwm{}", channel));
    if !dir.exists() {
        write_attr(chip, "export", channel)?;
        // udev needs a moment to create the attribute files
        for _ in 0..20 {
            if dir.join("period").exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }
    anyhow::ensure!(dir.is_dir(), "pwm channel {} did not appear under {}", channel, chip.display());
    Ok(dir)
}

fn write_attr(dir: &Path, attr: &str, value: impl fmt::Display) -> Result<()> {
    let path = dir.join(attr);
    std::fs::write(&path, value.to_string()).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servo_and_esc_pulses_match_hardware_table() {
        let servo = PulseRange::SERVO_270;
        assert_eq!(servo.pulse_us(-1.0), 500.0);
        assert_eq!(servo.pulse_us(0.0), 1500.0);
        assert_eq!(servo.pulse_us(1.0), 2500.0);

        let esc = PulseRange::ESC_BIDIR;
        assert_eq!(esc.pulse_us(-1.0), 1000.0);
        assert_eq!(esc.pulse_us(0.5), 1750.0);
        // out-of-range input saturates instead of overdriving
        assert_eq!(esc.pulse_us(3.0), 2000.0);
    }

    #[test]
    fn sysfs_driver_writes_period_and_duty() {
        let root = std::env::temp_dir().join(format!("skiff-pwm-{}", std::process::id()));
        let chip = root.join("pwmchip2");
        for ch in ["pwm2", "pwm3"] {
            std::fs::create_dir_all(chip.join(ch)).unwrap();
        }
        let cfg = HelmConfig::default();
        let mut pwm = SysfsPwm::open_at(&root, &cfg).unwrap();

        let read = |ch: &str, attr: &str| std::fs::read_to_string(chip.join(ch).join(attr)).unwrap();
        assert_eq!(read("pwm3", "period"), "20000000");
        assert_eq!(read("pwm3", "duty_cycle"), "1500000");
        assert_eq!(read("pwm2", "enable"), "1");

        pwm.set_angle(Channel::Thrust, 0.5).unwrap();
        assert_eq!(read("pwm2", "duty_cycle"), "1750000");
        assert!(matches!(
            pwm.set_angle(Channel::Rudder, 1.5),
            Err(DriverError::OutOfRange { channel: Channel::Rudder, .. })
        ));

        pwm.shutdown().unwrap();
        assert_eq!(read("pwm3", "enable"), "0");
        std::fs::remove_dir_all(&root).ok();
    }
}
