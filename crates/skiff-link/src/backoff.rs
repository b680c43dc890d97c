use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Multiplicative reconnect delay, reset by a successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60), 1.5)
    }
}

impl ReconnectPolicy {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(min);
        Self { current: min, min, max, multiplier: multiplier.max(1.0) }
    }

    /// Delay to wait now; the following one grows by the multiplier.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
