//! Automatic reconnection for connections.
//!
//! `ReconnectionWrapper` keeps its inner connection open: a watchdog task
//! watches the inner state and reopens it whenever it drops, retrying with
//! a fixed interval. The wrapper's own externally visible state is derived
//! from what the watchdog is doing (`CONNECTING` while recovering,
//! `CONNECTED` while the inner link is up).

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Connection, ConnectionCore, ConnectionState};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct Watchdog {
    task: JoinHandle<()>,
    quit_tx: watch::Sender<bool>,
}

/// Wraps a connection and silently reopens it when it breaks or cannot be
/// opened.
///
/// The wrapper is generic over the inner connection type so callers keep
/// access to its domain-specific methods through `inner()`. Errors of the
/// inner connection are forced into swallow mode: read/write failures turn
/// into a close, which the watchdog then recovers from.
pub struct ReconnectionWrapper<C: Connection + 'static> {
    core: Arc<ConnectionCore>,
    inner: Arc<C>,
    retry_interval: Duration,
    watchdog: Mutex<Option<Watchdog>>,
}

impl<C: Connection + 'static> ReconnectionWrapper<C> {
    pub fn new(inner: Arc<C>) -> Self {
        Self::with_retry_interval(inner, DEFAULT_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(inner: Arc<C>, retry_interval: Duration) -> Self {
        inner.set_swallow_errors(true);
        Self {
            core: Arc::new(ConnectionCore::new()),
            inner,
            retry_interval,
            watchdog: Mutex::new(None),
        }
    }

    /// The wrapped connection. Never call `close()` on it directly; use
    /// the wrapper's `close()` so the watchdog is stopped as well.
    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    fn spawn_watchdog(&self) {
        let (quit_tx, quit_rx) = watch::channel(false);
        let task = tokio::spawn(watchdog_loop(
            Arc::clone(&self.inner),
            Arc::clone(&self.core),
            self.retry_interval,
            quit_rx,
        ));
        *self.watchdog.lock().unwrap() = Some(Watchdog { task, quit_tx });
    }
}

impl<C: Connection + 'static> Connection for ReconnectionWrapper<C> {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn open(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            match self.core.state() {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                _ => {}
            }

            self.core.set_state(
                if self.inner.state() == ConnectionState::Connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Connecting
                },
            );
            self.spawn_watchdog();
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            match self.core.state() {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    return Ok(())
                }
                _ => {}
            }

            self.core.set_state(ConnectionState::Disconnecting);

            let watchdog = self.watchdog.lock().unwrap().take();
            if let Some(watchdog) = watchdog {
                let _ = watchdog.quit_tx.send(true);
                let _ = watchdog.task.await;
            }
            let result = self.inner.close().await;

            self.core.set_state(ConnectionState::Disconnected);
            result
        }
        .boxed()
    }
}

impl<C: Connection + 'static> Drop for ReconnectionWrapper<C> {
    fn drop(&mut self) {
        // The wrapper owns the watchdog; destroying the aggregate cancels
        // the task.
        if let Some(watchdog) = self.watchdog.lock().unwrap().take() {
            watchdog.task.abort();
        }
    }
}

/// Keeps the inner connection in `CONNECTED`.
///
/// - inner `DISCONNECTED`: enter recovery, call `open()`, retry after
///   `retry_interval` until it sticks;
/// - inner `CONNECTING` / `DISCONNECTING`: wait for the next transition;
/// - inner `CONNECTED`: leave recovery (regardless of who established the
///   link) and wait for the next transition.
async fn watchdog_loop<C: Connection>(
    inner: Arc<C>,
    wrapper_core: Arc<ConnectionCore>,
    retry_interval: Duration,
    mut quit_rx: watch::Receiver<bool>,
) {
    let mut state_rx = inner.core().subscribe();

    loop {
        if *quit_rx.borrow() {
            break;
        }

        let current_state = *state_rx.borrow_and_update();
        match current_state {
            ConnectionState::Disconnected => {
                wrapper_core.set_state(ConnectionState::Connecting);
                if let Err(error) = inner.open().await {
                    debug!(error = %error, "reconnection attempt failed");
                }
                // The attempt itself produced transitions; mark them as
                // seen so a failed attempt actually waits out the retry
                // interval instead of spinning.
                if *state_rx.borrow_and_update() == ConnectionState::Connected {
                    continue;
                }
                tokio::select! {
                    _ = quit_rx.changed() => {}
                    _ = state_rx.changed() => {}
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                tokio::select! {
                    _ = quit_rx.changed() => {}
                    _ = state_rx.changed() => {}
                }
            }
            ConnectionState::Connected => {
                wrapper_core.set_state(ConnectionState::Connected);
                tokio::select! {
                    _ = quit_rx.changed() => {}
                    _ = state_rx.changed() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::DummyConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn recovers_from_initial_open_failures() {
        let inner = DummyConnection::new();
        inner.fail_next_opens(3);
        let wrapper = Arc::new(ReconnectionWrapper::new(Arc::clone(&inner)));

        let connects = Arc::new(AtomicUsize::new(0));
        let _binding = {
            let connects = Arc::clone(&connects);
            wrapper.events().connected.connect(move |_| {
                connects.fetch_add(1, Ordering::SeqCst);
            })
        };

        wrapper.open().await.unwrap();
        assert_eq!(wrapper.state(), ConnectionState::Connecting);

        // Three failed attempts, one second apart, then success.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(wrapper.state(), ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(wrapper.state(), ConnectionState::Connected);
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        wrapper.close().await.unwrap();
        assert_eq!(wrapper.state(), ConnectionState::Disconnected);
        assert_eq!(inner.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reopens_after_link_drop() {
        let inner = DummyConnection::new();
        let wrapper = Arc::new(ReconnectionWrapper::new(Arc::clone(&inner)));

        wrapper.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(wrapper.state(), ConnectionState::Connected);

        inner.drop_link();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(inner.state(), ConnectionState::Connected);
        assert_eq!(wrapper.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn settles_under_flapping() {
        let inner = DummyConnection::new();
        let wrapper = Arc::new(ReconnectionWrapper::new(Arc::clone(&inner)));
        wrapper.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Flap at 10 Hz for one simulated second.
        for _ in 0..10 {
            inner.drop_link();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(inner.state(), ConnectionState::Connected);
        assert_eq!(wrapper.state(), ConnectionState::Connected);

        wrapper.close().await.unwrap();
        assert_eq!(wrapper.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_watchdog() {
        let inner = DummyConnection::new();
        let wrapper = Arc::new(ReconnectionWrapper::new(Arc::clone(&inner)));
        wrapper.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        wrapper.close().await.unwrap();

        // The watchdog is gone: a dropped link is not recovered any more.
        inner.open().await.unwrap();
        inner.drop_link();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(inner.state(), ConnectionState::Disconnected);
        assert_eq!(wrapper.state(), ConnectionState::Disconnected);
    }
}
