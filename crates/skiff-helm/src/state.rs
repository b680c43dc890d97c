use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MotorState {
    pub rudder_deg: f64,
    pub throttle_pct: f64,
    pub initialized: bool,
}

/// Read-only view of the helm's motor state. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct MotorStatus {
    rx: watch::Receiver<MotorState>,
}

impl MotorStatus {
    pub(crate) fn new(rx: watch::Receiver<MotorState>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> MotorState {
        *self.rx.borrow()
    }
}
