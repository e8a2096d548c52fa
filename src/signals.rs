//! Synchronous observer signals.
//!
//! Every entity that emits events (connections, registries, the extension
//! manager) owns its own `Signal` instances, so subscribing to a particular
//! instance already scopes the subscription to that sender. Emission walks
//! the subscribers in subscription order on the calling task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// One subscriber of a signal.
struct Subscriber<T> {
    id: u64,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

struct SignalInner<T> {
    subscribers: RwLock<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
}

/// A dispatch point that interested parties may connect callbacks to.
///
/// Cloning a `Signal` yields another handle to the same subscriber list.
/// Emission snapshots the subscriber list first, so a callback may connect
/// or disconnect subscribers of the same signal without deadlocking.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Connects a callback and returns a binding that disconnects it when
    /// dropped. Callbacks run synchronously, in subscription order.
    #[must_use = "dropping the binding disconnects the callback"]
    pub fn connect<F>(&self, callback: F) -> SignalBinding
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().unwrap().push(Subscriber {
            id,
            callback: Arc::new(callback),
        });

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        SignalBinding {
            disconnect: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .subscribers
                        .write()
                        .unwrap()
                        .retain(|sub| sub.id != id);
                }
            })),
        }
    }

    /// Invokes every connected callback with the given payload.
    pub fn emit(&self, payload: &T) {
        // Snapshot so callbacks may re-enter connect()/disconnect().
        let callbacks: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .inner
            .subscribers
            .read()
            .unwrap()
            .iter()
            .map(|sub| Arc::clone(&sub.callback))
            .collect();
        for callback in callbacks {
            callback(payload);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().unwrap().len()
    }
}

/// RAII handle for a signal subscription; dropping it disconnects the
/// callback. Call `detach()` to keep the subscription for the lifetime of
/// the signal instead.
pub struct SignalBinding {
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SignalBinding {
    /// Leaves the callback connected forever and consumes the binding.
    pub fn detach(mut self) {
        self.disconnect = None;
    }
}

impl Drop for SignalBinding {
    fn drop(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl std::fmt::Debug for SignalBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBinding")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_in_subscription_order() {
        let signal: Signal<u32> = Signal::new();
        let seen = Arc::new(RwLock::new(Vec::new()));

        let first = {
            let seen = Arc::clone(&seen);
            signal.connect(move |value| seen.write().unwrap().push(("first", *value)))
        };
        let second = {
            let seen = Arc::clone(&seen);
            signal.connect(move |value| seen.write().unwrap().push(("second", *value)))
        };

        signal.emit(&7);
        assert_eq!(&*seen.read().unwrap(), &[("first", 7), ("second", 7)]);

        drop(first);
        signal.emit(&8);
        assert_eq!(seen.read().unwrap().last(), Some(&("second", 8)));
        drop(second);
    }

    #[test]
    fn dropping_binding_disconnects() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let binding = {
            let hits = Arc::clone(&hits);
            signal.connect(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        signal.emit(&());
        drop(binding);
        signal.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn callback_may_resubscribe_during_emit() {
        let signal: Signal<()> = Signal::new();
        let signal2 = signal.clone();
        let binding = signal.connect(move |_| {
            // Re-entrant connect must not deadlock.
            signal2.connect(|_| {}).detach();
        });
        signal.emit(&());
        assert_eq!(signal.subscriber_count(), 2);
        drop(binding);
    }

    #[test]
    fn detach_keeps_subscription() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            signal
                .connect(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }
        signal.emit(&());
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
