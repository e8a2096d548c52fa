//! Registry of the clocks and timers the server knows about.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::error::RegistryError;
use crate::model::clock::Clock;
use crate::signals::{Signal, SignalBinding};

use super::{RegistryBase, RemovalGuard};

/// Registry of clocks.
///
/// The per-clock `started`, `stopped` and `changed` signals are
/// re-dispatched as one generic `clock_changed(clock)` signal; subscribe
/// to the clock itself when the exact cause matters.
pub struct ClockRegistry {
    self_ref: Weak<ClockRegistry>,
    base: RegistryBase<Arc<dyn Clock>>,
    clock_changed: Signal<Arc<dyn Clock>>,
    subscriptions: DashMap<String, Vec<SignalBinding>>,
}

impl ClockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            base: RegistryBase::new(),
            clock_changed: Signal::new(),
            subscriptions: DashMap::new(),
        })
    }

    pub fn clock_changed(&self) -> &Signal<Arc<dyn Clock>> {
        &self.clock_changed
    }

    /// Registers a clock. No-op when the same clock is already registered;
    /// an error when its id is taken by a different clock.
    pub fn add(&self, clock: Arc<dyn Clock>) -> Result<(), RegistryError> {
        let id = clock.id().to_owned();
        if let Some(existing) = self.base.find_by_id(&id) {
            if Arc::ptr_eq(&existing, &clock) {
                return Ok(());
            }
            return Err(RegistryError::IdTaken(id));
        }

        let mut bindings = Vec::with_capacity(3);
        for signal in [
            &clock.events().started,
            &clock.events().stopped,
            &clock.events().changed,
        ] {
            let redispatch = self.clock_changed.clone();
            let clock = Arc::clone(&clock);
            bindings.push(signal.connect(move |_| redispatch.emit(&clock)));
        }
        self.subscriptions.insert(id.clone(), bindings);

        self.base.insert(id, clock);
        Ok(())
    }

    pub fn remove(&self, clock: &Arc<dyn Clock>) -> Option<Arc<dyn Clock>> {
        self.remove_by_id(clock.id())
    }

    pub fn remove_by_id(&self, clock_id: &str) -> Option<Arc<dyn Clock>> {
        self.subscriptions.remove(clock_id);
        self.base.take(clock_id)
    }

    /// Scoped registration: the clock stays registered while the returned
    /// guard lives.
    pub fn use_clock(&self, clock: Arc<dyn Clock>) -> Result<RemovalGuard, RegistryError> {
        let id = clock.id().to_owned();
        self.add(clock)?;
        let registry = self.self_ref.clone();
        Ok(RemovalGuard::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_by_id(&id);
            }
        }))
    }
}

impl Deref for ClockRegistry {
    type Target = RegistryBase<Arc<dyn Clock>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn redispatches_clock_signals() {
        let registry = ClockRegistry::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        registry.add(Arc::clone(&clock)).unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let _binding = {
            let changes = Arc::clone(&changes);
            registry.clock_changed().connect(move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            })
        };

        clock.events().started.emit(&());
        clock.events().changed.emit(&());
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        registry.remove(&clock);
        clock.events().stopped.emit(&());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn same_clock_twice_is_a_no_op_and_conflicts_error() {
        let registry = ClockRegistry::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        registry.add(Arc::clone(&clock)).unwrap();
        registry.add(Arc::clone(&clock)).unwrap();
        assert_eq!(registry.num_entries(), 1);

        let conflicting: Arc<dyn Clock> = Arc::new(SystemClock::new());
        assert!(registry.add(conflicting).is_err());
    }
}
