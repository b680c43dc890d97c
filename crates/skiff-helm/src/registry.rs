use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use tracing::{error, info};

/// Something that can put its outputs into a safe position without an
/// async runtime and without blocking indefinitely.
pub trait SafeStop: Send + Sync {
    fn name(&self) -> &str;
    fn make_safe(&self);
}

#[derive(Default)]
struct Entries {
    next_id: u64,
    live: BTreeMap<u64, Arc<dyn SafeStop>>,
}

/// Actuators that must be made safe when the process exits, however it exits.
/// Passed explicitly to whoever creates actuators; there is no global instance.
#[derive(Clone, Default)]
pub struct ActuatorRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl ActuatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The returned guard makes the target safe and unregisters it when dropped.
    #[must_use = "dropping the registration immediately makes the actuator safe"]
    pub fn register(&self, target: Arc<dyn SafeStop>) -> Registration {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let id = entries.next_id;
        entries.next_id += 1;
        entries.live.insert(id, target.clone());
        info!("helm: registered '{}' for safe shutdown", target.name());
        Registration { registry: self.clone(), id, target }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every registered actuator safe. Returns how many were visited.
    pub fn make_all_safe(&self) -> usize {
        let targets: Vec<_> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.live.values().cloned().collect()
        };
        for t in &targets {
            t.make_safe();
        }
        targets.len()
    }

    /// Like [`make_all_safe`](Self::make_all_safe) but gives up instead of
    /// waiting on the registry lock. Used from the panic hook.
    pub fn try_make_all_safe(&self) -> Option<usize> {
        let targets: Vec<_> = match self.entries.try_lock() {
            Ok(entries) => entries.live.values().cloned().collect(),
            Err(TryLockError::Poisoned(p)) => p.into_inner().live.values().cloned().collect(),
            Err(TryLockError::WouldBlock) => return None,
        };
        for t in &targets {
            t.make_safe();
        }
        Some(targets.len())
    }

    /// Chain a panic hook that makes every registered actuator safe before
    /// the previous hook runs.
    pub fn install_panic_hook(&self) {
        let registry = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            if registry.try_make_all_safe().is_none() {
                error!("helm: registry busy during panic, actuators not made safe");
            }
            previous(panic_info);
        }));
    }

    fn unregister(&self, id: u64) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).live.remove(&id);
    }
}

/// Scoped ownership of a registered actuator.
pub struct Registration {
    registry: ActuatorRegistry,
    id: u64,
    target: Arc<dyn SafeStop>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.target.make_safe();
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SafeStop for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn make_safe(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn guard_drop_makes_safe_and_unregisters() {
        let registry = ActuatorRegistry::new();
        let target = Arc::new(Counter::default());
        let guard = registry.register(target.clone());
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.make_all_safe(), 0);
    }

    #[test]
    fn make_all_safe_visits_every_live_entry() {
        let registry = ActuatorRegistry::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let _ga = registry.register(a.clone());
        let _gb = registry.register(b.clone());

        assert_eq!(registry.make_all_safe(), 2);
        assert_eq!(registry.try_make_all_safe(), Some(2));
        assert_eq!(a.0.load(Ordering::SeqCst), 2);
        assert_eq!(b.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn separate_registries_do_not_share_entries() {
        let one = ActuatorRegistry::new();
        let two = ActuatorRegistry::new();
        let _g = one.register(Arc::new(Counter::default()));
        assert_eq!(one.len(), 1);
        assert!(two.is_empty());
    }

    #[test]
    fn helm_is_neutral_after_its_guard_drops() {
        let (helm, _rec) = crate::helm::tests::helm();
        helm.set_rudder(60.0).unwrap();
        let registry = ActuatorRegistry::new();
        let guard = registry.register(helm.clone());
        drop(guard);
        assert_eq!(helm.state().rudder_deg, 0.0);
        assert!(!helm.state().initialized);
    }
}
