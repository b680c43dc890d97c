use anyhow::Result;
use std::path::Path;

use crate::command::MAX_RAMP_TIME_S;
use crate::{HelmConfig, MIN_STEP_SIZE, RUDDER_LIMIT_DEG, THROTTLE_LIMIT_PCT};

pub fn check_helm(cfg: &HelmConfig) -> Result<()> {
    anyhow::ensure!(cfg.driver == "sysfs-pwm", "unknown helm.driver: {}", cfg.driver);
    anyhow::ensure!(
        cfg.max_rudder_angle.is_finite() && cfg.max_rudder_angle > 0.0 && cfg.max_rudder_angle <= RUDDER_LIMIT_DEG,
        "helm.max_rudder_angle must be in (0, {}], got {}",
        RUDDER_LIMIT_DEG,
        cfg.max_rudder_angle
    );
    anyhow::ensure!(
        (MIN_STEP_SIZE..=THROTTLE_LIMIT_PCT).contains(&cfg.step_size),
        "helm.step_size must be in [{}, {}], got {}",
        MIN_STEP_SIZE,
        THROTTLE_LIMIT_PCT,
        cfg.step_size
    );
    anyhow::ensure!(
        (0.0..=MAX_RAMP_TIME_S).contains(&cfg.default_ramp_s),
        "helm.default_ramp_s must be 0..{}",
        MAX_RAMP_TIME_S
    );
    anyhow::ensure!((40..=400).contains(&cfg.frequency_hz), "helm.frequency_hz should be 40..400 for servos/ESCs");
    anyhow::ensure!(cfg.rudder_channel != cfg.thrust_channel, "helm rudder and thrust share pwm channel {}", cfg.rudder_channel);
    Ok(())
}

/// The PWM chip, when the helm is enabled and the chip is absent.
pub fn missing_pwm_chip(cfg: &HelmConfig) -> Option<String> {
    if !cfg.enable {
        return None;
    }
    let chip = format!("/sys/class/pwm/pwmchip{}", cfg.pwm_chip);
    (!Path::new(&chip).is_dir()).then_some(chip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_and_limits_hold() {
        check_helm(&HelmConfig::default()).unwrap();
        assert!(check_helm(&HelmConfig { max_rudder_angle: 150.0, ..Default::default() }).is_err());
        assert!(check_helm(&HelmConfig { step_size: 0.0, ..Default::default() }).is_err());
        assert!(check_helm(&HelmConfig { step_size: 0.01, ..Default::default() }).is_err());
        check_helm(&HelmConfig { step_size: 0.1, ..Default::default() }).unwrap();
        assert!(check_helm(&HelmConfig { thrust_channel: 3, ..Default::default() }).is_err());
        assert!(missing_pwm_chip(&HelmConfig::default()).is_none());
        let enabled = HelmConfig { enable: true, pwm_chip: 99, ..Default::default() };
        assert_eq!(missing_pwm_chip(&enabled).as_deref(), Some("/sys/class/pwm/pwmchip99"));
    }
}
