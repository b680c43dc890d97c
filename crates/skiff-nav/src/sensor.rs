use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Latest-value cell: one worker thread writes, any number of readers take
/// consistent snapshots.
#[derive(Debug, Default)]
pub struct SensorCell<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for SensorCell<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone> SensorCell<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(RwLock::new(value)) }
    }

    pub fn snapshot(&self) -> T {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn publish(&self, value: T) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Stop flag handed to a polling step so long waits can bail out early.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Sleep up to `dur`, returning early once the flag is set.
    pub fn nap(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        while !self.is_set() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(Duration::from_millis(50)));
        }
    }
}

/// A sensor acquisition loop on its own OS thread.
pub struct SensorWorker {
    name: String,
    stop: StopFlag,
    handle: JoinHandle<()>,
}

impl SensorWorker {
    /// Run `step` until stopped. A failing step is logged and retried after
    /// `retry`; the step itself is expected to block for at most about a second.
    pub fn spawn<F>(name: &str, retry: Duration, mut step: F) -> Result<Self>
    where
        F: FnMut(&StopFlag) -> Result<()> + Send + 'static,
    {
        let stop = StopFlag::default();
        let flag = stop.clone();
        let label = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("sensor-{}", name))
            .spawn(move || {
                while !flag.is_set() {
                    if let Err(e) = step(&flag) {
                        warn!("{}: {:#}", label, e);
                        flag.nap(retry);
                    }
                }
                debug!("{}: worker exiting", label);
            })
            .with_context(|| format!("spawn {} worker", name))?;
        Ok(Self { name: name.to_string(), stop, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the loop and wait up to `timeout` for it to exit. Returns false
    /// if the thread was abandoned still running.
    pub fn stop(self, timeout: Duration) -> bool {
        self.stop.set();
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("{}: worker did not stop within {:?}, abandoning it", self.name, timeout);
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.handle.join().is_err() {
            warn!("{}: worker panicked", self.name);
        }
        true
    }
}
