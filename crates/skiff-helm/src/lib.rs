pub mod command;
pub mod doctor;
pub mod driver;
pub mod helm;
pub mod journal;
pub mod registry;
pub mod state;

use serde::Deserialize;

pub use command::{CommandError, HelmCommand};
pub use driver::{ActuatorDriver, Channel, DriverError, SysfsPwm};
pub use helm::{Helm, HelmLimits};
pub use journal::CommandLog;
pub use registry::{ActuatorRegistry, Registration, SafeStop};
pub use state::{MotorState, MotorStatus};

/// Servo mechanical travel either side of center.
pub const RUDDER_LIMIT_DEG: f64 = 135.0;
/// ESC command range either side of neutral.
pub const THROTTLE_LIMIT_PCT: f64 = 100.0;
/// Finest throttle ramp granularity accepted from configuration.
pub const MIN_STEP_SIZE: f64 = 0.1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HelmConfig {
    /// When false no actuator layer is attached; actuating commands are rejected
    /// and legacy commands are acknowledged without effect.
    pub enable: bool,

    /// "sysfs-pwm" is the only hardware driver.
    pub driver: String,

    /// Raspberry Pi 5: chip 2 exposes GPIO18/GPIO19 as channels 2/3.
    pub pwm_chip: u32,
    pub rudder_channel: u32,
    pub thrust_channel: u32,
    pub frequency_hz: u32,

    /// Rudder deflection at position 100, in degrees.
    pub max_rudder_angle: f64,

    /// Throttle ramp granularity in percent.
    pub step_size: f64,

    /// Ramp duration when a command omits ramp_time (and for stop).
    pub default_ramp_s: f64,

    /// Append-only journal of received commands (JSON lines). None disables it.
    pub command_log: Option<String>,
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            enable: false,
            driver: "sysfs-pwm".into(),
            pwm_chip: 2,
            rudder_channel: 3,
            thrust_channel: 2,
            frequency_hz: 50,
            max_rudder_angle: 45.0,
            step_size: 2.0,
            default_ramp_s: 1.0,
            command_log: Some("command_log.jsonl".into()),
        }
    }
}
