use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{CommandError, HelmCommand, MAX_RAMP_TIME_S};
use crate::driver::{ActuatorDriver, Channel};
use crate::registry::SafeStop;
use crate::state::{MotorState, MotorStatus};
use crate::{HelmConfig, MIN_STEP_SIZE, RUDDER_LIMIT_DEG, THROTTLE_LIMIT_PCT};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HelmLimits {
    /// Deflection at rudder position ±100.
    pub max_rudder_deg: f64,
    /// Largest throttle change applied in one driver write.
    pub step_size: f64,
    pub default_ramp: Duration,
}

impl HelmLimits {
    pub fn from_config(cfg: &HelmConfig) -> Self {
        let max_rudder_deg = if cfg.max_rudder_angle.is_finite() {
            cfg.max_rudder_angle.abs().min(RUDDER_LIMIT_DEG)
        } else {
            45.0
        };
        let step_size = if cfg.step_size.is_finite() && cfg.step_size > 0.0 {
            cfg.step_size.clamp(MIN_STEP_SIZE, THROTTLE_LIMIT_PCT)
        } else {
            2.0
        };
        let default_ramp = Duration::try_from_secs_f64(cfg.default_ramp_s.clamp(0.0, MAX_RAMP_TIME_S))
            .unwrap_or(Duration::from_secs(1));
        Self { max_rudder_deg, step_size, default_ramp }
    }
}

impl Default for HelmLimits {
    fn default() -> Self {
        Self::from_config(&HelmConfig::default())
    }
}

/// Rudder position in [-100, 100] to degrees. Out-of-range positions clamp,
/// and the result never exceeds the servo's mechanical travel.
pub fn rudder_degrees(position: f64, max_rudder_deg: f64) -> f64 {
    let p = position.clamp(-100.0, 100.0);
    (p / 100.0 * max_rudder_deg).clamp(-RUDDER_LIMIT_DEG, RUDDER_LIMIT_DEG)
}

/// Throttle values to write, in order, to get from `current` to `target`.
/// The last entry is always exactly `target`.
pub fn ramp_plan(current: f64, target: f64, step: f64) -> Vec<f64> {
    let delta = target - current;
    if delta.abs() <= step {
        return vec![target];
    }
    let steps = (delta.abs() / step).ceil() as usize;
    let dir = delta.signum();
    (1..=steps)
        .map(|i| if i == steps { target } else { current + i as f64 * step * dir })
        .collect()
}

/// The actuator safety layer. Sole owner of the driver: every write goes
/// through bounds checks here and is mirrored into [`MotorState`].
pub struct Helm {
    driver: Mutex<Box<dyn ActuatorDriver>>,
    state: watch::Sender<MotorState>,
    limits: HelmLimits,
    // Replaced on every interrupt; ramps hold a clone of the token current at their start.
    motion: Mutex<CancellationToken>,
    ramp_lock: tokio::sync::Mutex<()>,
}

impl Helm {
    pub fn new(driver: Box<dyn ActuatorDriver>, limits: HelmLimits) -> Self {
        let (state, _) = watch::channel(MotorState::default());
        Self {
            driver: Mutex::new(driver),
            state,
            limits,
            motion: Mutex::new(CancellationToken::new()),
            ramp_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn limits(&self) -> HelmLimits {
        self.limits
    }

    pub fn state(&self) -> MotorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> MotorStatus {
        MotorStatus::new(self.state.subscribe())
    }

    /// Drive both outputs to neutral and start accepting commands.
    pub fn initialize(&self) -> Result<(), CommandError> {
        self.write(Channel::Thrust, 0.0, None)?;
        self.write(Channel::Rudder, 0.0, None)?;
        self.state.send_modify(|s| s.initialized = true);
        info!(
            "helm: initialized (max rudder {:.0}°, step {}%, default ramp {:?})",
            self.limits.max_rudder_deg, self.limits.step_size, self.limits.default_ramp
        );
        Ok(())
    }

    /// Returns the applied deflection in degrees.
    pub fn set_rudder(&self, position: f64) -> Result<f64, CommandError> {
        if !position.is_finite() {
            return Err(CommandError::InvalidField { field: "position", reason: "is not a finite number".into() });
        }
        self.ensure_initialized()?;
        let deg = rudder_degrees(position, self.limits.max_rudder_deg);
        self.write(Channel::Rudder, deg, None)?;
        debug!("helm: rudder {:.1}° (position {})", deg, position);
        Ok(deg)
    }

    /// Walk the throttle to `target` percent over `ramp` (default ramp when None).
    /// Small changes are applied in one write. Returns `Cancelled` if an
    /// emergency stop or release interrupts the walk.
    pub async fn set_throttle(&self, target: f64, ramp: Option<Duration>) -> Result<(), CommandError> {
        self.ramp_throttle(target, ramp, self.motion_token()).await
    }

    async fn ramp_throttle(
        &self,
        target: f64,
        ramp: Option<Duration>,
        motion: CancellationToken,
    ) -> Result<(), CommandError> {
        if !target.is_finite() || !(-THROTTLE_LIMIT_PCT..=THROTTLE_LIMIT_PCT).contains(&target) {
            return Err(CommandError::OutOfRange {
                field: "throttle",
                value: target,
                min: -THROTTLE_LIMIT_PCT,
                max: THROTTLE_LIMIT_PCT,
            });
        }
        self.ensure_initialized()?;

        let _ramp = tokio::select! {
            guard = self.ramp_lock.lock() => guard,
            _ = motion.cancelled() => return Err(CommandError::Cancelled),
        };

        let plan = ramp_plan(self.state().throttle_pct, target, self.limits.step_size);
        let delay = ramp.unwrap_or(self.limits.default_ramp).div_f64(plan.len() as f64);
        for (i, value) in plan.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = motion.cancelled() => return Err(CommandError::Cancelled),
                }
            }
            self.write(Channel::Thrust, *value, Some(&motion))?;
        }
        debug!("helm: throttle {}% in {} step(s)", target, plan.len());
        Ok(())
    }

    /// Rudder to center and throttle to zero, concurrently. Both must succeed.
    pub async fn stop(&self) -> Result<(), CommandError> {
        self.stop_with(self.motion_token()).await
    }

    async fn stop_with(&self, motion: CancellationToken) -> Result<(), CommandError> {
        let (rudder, throttle) = tokio::join!(
            async { self.set_rudder(0.0).map(|_| ()) },
            self.ramp_throttle(0.0, Some(self.limits.default_ramp), motion),
        );
        let failures: Vec<String> = [("rudder", rudder), ("throttle", throttle)]
            .into_iter()
            .filter_map(|(part, res)| res.err().map(|e| format!("{}: {}", part, e)))
            .collect();
        if failures.is_empty() {
            info!("helm: stopped");
            Ok(())
        } else {
            Err(CommandError::PartialStop(failures.join("; ")))
        }
    }

    /// Thrust neutral without ramping, rudder centered. Interrupts any ramp.
    pub fn emergency_stop(&self) -> Result<(), CommandError> {
        self.interrupt_motion();
        let thrust = self.write(Channel::Thrust, 0.0, None);
        let rudder = self.write(Channel::Rudder, 0.0, None);
        warn!("helm: emergency stop");
        thrust.and(rudder)
    }

    /// Neutral outputs, driver shut down, further commands rejected until
    /// [`Helm::initialize`] runs again.
    pub fn release(&self) -> Result<(), CommandError> {
        self.interrupt_motion();
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        let res = self.neutralize(&mut **driver);
        info!("helm: released");
        res
    }

    pub async fn execute(&self, cmd: &HelmCommand) -> Result<String, CommandError> {
        self.execute_with(cmd, self.motion_token()).await
    }

    /// Like [`execute`](Self::execute), with ramps bound to a `motion` token
    /// taken earlier from [`motion`](Self::motion). An interrupt between taking
    /// the token and running the command makes the command fail with `Cancelled`.
    pub async fn execute_with(&self, cmd: &HelmCommand, motion: CancellationToken) -> Result<String, CommandError> {
        match cmd {
            HelmCommand::SetRudder { position } => {
                let deg = self.set_rudder(*position)?;
                Ok(format!("rudder set to {:.1}°", deg))
            }
            HelmCommand::SetThrottle { throttle, ramp_time } => {
                let ramp = ramp_time
                    .map(|s| {
                        Duration::try_from_secs_f64(s).map_err(|e| CommandError::InvalidField {
                            field: "ramp_time",
                            reason: e.to_string(),
                        })
                    })
                    .transpose()?;
                self.ramp_throttle(*throttle, ramp, motion).await?;
                Ok(format!("throttle set to {}%", throttle))
            }
            HelmCommand::Stop => {
                self.stop_with(motion).await?;
                Ok("stopped".into())
            }
            HelmCommand::EmergencyStop => {
                self.emergency_stop()?;
                Ok("emergency stop: thrust neutral, rudder centered".into())
            }
            other => Err(CommandError::Unknown(other.name().to_string())),
        }
    }

    fn ensure_initialized(&self) -> Result<(), CommandError> {
        if self.state.borrow().initialized {
            Ok(())
        } else {
            Err(CommandError::NotInitialized)
        }
    }

    /// The token the next motion runs under. [`interrupt_motion`](Self::interrupt_motion)
    /// cancels it.
    pub fn motion(&self) -> CancellationToken {
        self.motion_token()
    }

    fn motion_token(&self) -> CancellationToken {
        self.motion.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Cancel the running ramp, if any. Outputs stay where the ramp left them.
    pub fn interrupt_motion(&self) {
        let mut motion = self.motion.lock().unwrap_or_else(PoisonError::into_inner);
        motion.cancel();
        *motion = CancellationToken::new();
    }

    /// `value` is in physical units (degrees or percent). A write made on behalf
    /// of an interrupted motion is dropped under the driver lock, so it cannot
    /// land after an emergency stop.
    fn write(&self, channel: Channel, value: f64, motion: Option<&CancellationToken>) -> Result<(), CommandError> {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if motion.is_some_and(|m| m.is_cancelled()) {
            return Err(CommandError::Cancelled);
        }
        self.write_locked(&mut **driver, channel, value)
    }

    fn write_locked(&self, driver: &mut dyn ActuatorDriver, channel: Channel, value: f64) -> Result<(), CommandError> {
        let normalized = match channel {
            Channel::Rudder => value / RUDDER_LIMIT_DEG,
            Channel::Thrust => value / THROTTLE_LIMIT_PCT,
        };
        driver.set_angle(channel, normalized)?;
        self.state.send_modify(|s| match channel {
            Channel::Rudder => s.rudder_deg = value,
            Channel::Thrust => s.throttle_pct = value,
        });
        Ok(())
    }

    fn neutralize(&self, driver: &mut dyn ActuatorDriver) -> Result<(), CommandError> {
        let thrust = self.write_locked(driver, Channel::Thrust, 0.0);
        let rudder = self.write_locked(driver, Channel::Rudder, 0.0);
        self.state.send_modify(|s| s.initialized = false);
        let shutdown = driver.shutdown().map_err(CommandError::from);
        thrust.and(rudder).and(shutdown)
    }
}

impl SafeStop for Helm {
    fn name(&self) -> &str {
        "helm"
    }

    // May run from a panic hook on a thread that already holds the driver
    // lock, so never block on it.
    fn make_safe(&self) {
        self.interrupt_motion();
        for _ in 0..5 {
            match self.driver.try_lock() {
                Ok(mut driver) => {
                    if let Err(e) = self.neutralize(&mut **driver) {
                        error!("helm: safe-position failed: {}", e);
                    }
                    return;
                }
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    let mut driver = p.into_inner();
                    if let Err(e) = self.neutralize(&mut **driver) {
                        error!("helm: safe-position failed: {}", e);
                    }
                    return;
                }
                Err(std::sync::TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        error!("helm: driver busy, outputs left as they were");
    }
}
