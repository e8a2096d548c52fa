//! Stateful connections to external links (drone radios, GPS receivers,
//! RTK sources, ...).
//!
//! Every connection moves through the same four-state machine:
//!
//! ```text
//! DISCONNECTED --open()--> CONNECTING --(success)--> CONNECTED
//!                                     --(failure)--> DISCONNECTED
//! CONNECTED    --close()-> DISCONNECTING ----------> DISCONNECTED
//! CONNECTED    --(peer close / I/O error)----------> DISCONNECTED
//! ```
//!
//! `ConnectionCore` is the sole state mutator; concrete connection types
//! embed one and never touch the state directly.

pub mod file;
pub mod reconnection;
pub mod socket;
pub mod subnet;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::warn;

use crate::signals::Signal;

pub use reconnection::ReconnectionWrapper;

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
        }
    }
}

/// Payload of the `state_changed` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// The three signals every connection provides.
pub struct ConnectionEvents {
    /// Fired on every state transition.
    pub state_changed: Signal<StateChange>,
    /// Fired when the connection enters `CONNECTED` from any other state.
    pub connected: Signal<()>,
    /// Fired when a previously connected connection reaches `DISCONNECTED`.
    pub disconnected: Signal<()>,
}

struct StateSlot {
    state: ConnectionState,
    /// Set while we are "up" as far as the connected/disconnected signal
    /// pairing is concerned. Guarantees each `connected` has exactly one
    /// matching `disconnected`.
    connected_latched: bool,
}

/// Shared state-machine core embedded by every concrete connection.
pub struct ConnectionCore {
    slot: Mutex<StateSlot>,
    events: ConnectionEvents,
    watch_tx: watch::Sender<ConnectionState>,
    swallow_errors: AtomicBool,
}

impl Default for ConnectionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCore {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            slot: Mutex::new(StateSlot {
                state: ConnectionState::Disconnected,
                connected_latched: false,
            }),
            events: ConnectionEvents {
                state_changed: Signal::new(),
                connected: Signal::new(),
                disconnected: Signal::new(),
            },
            watch_tx,
            swallow_errors: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().unwrap().state
    }

    pub fn events(&self) -> &ConnectionEvents {
        &self.events
    }

    /// Sole mutator of the connection state. Decides the transition and
    /// the latch under the lock, then fires the signals outside of it so a
    /// subscriber may call back into the connection.
    pub fn set_state(&self, new: ConnectionState) {
        let (old, fire_connected, fire_disconnected) = {
            let mut slot = self.slot.lock().unwrap();
            let old = slot.state;
            if old == new {
                return;
            }
            slot.state = new;

            let fire_connected =
                new == ConnectionState::Connected && !slot.connected_latched;
            let fire_disconnected =
                new == ConnectionState::Disconnected && slot.connected_latched;
            if fire_connected {
                slot.connected_latched = true;
            }
            if fire_disconnected {
                slot.connected_latched = false;
            }
            // Waiters observe the new state no later than the signals.
            self.watch_tx.send_replace(new);
            (old, fire_connected, fire_disconnected)
        };

        self.events.state_changed.emit(&StateChange { old, new });
        if fire_connected {
            self.events.connected.emit(&());
        }
        if fire_disconnected {
            self.events.disconnected.emit(&());
        }
    }

    /// Subscribes to state transitions; used by watchdogs and waiters.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// Returns immediately when the connection is already connected,
    /// otherwise waits for the next transition into `CONNECTED`.
    pub async fn wait_until_connected(&self) {
        let mut rx = self.watch_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Connected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Counterpart of `wait_until_connected` for any state other than
    /// `CONNECTED`.
    pub async fn wait_until_not_connected(&self) {
        let mut rx = self.watch_tx.subscribe();
        loop {
            if *rx.borrow_and_update() != ConnectionState::Connected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether read/write errors should be converted into a silent close
    /// instead of propagating. Turned on by the reconnection wrapper.
    pub fn swallows_errors(&self) -> bool {
        self.swallow_errors.load(Ordering::Relaxed)
    }

    pub fn set_swallow_errors(&self, value: bool) {
        self.swallow_errors.store(value, Ordering::Relaxed);
    }
}

/// A stateful link to the outside world.
///
/// `open` and `close` are idempotent: calling them in a terminal or
/// already-transitioning state is a no-op, never an error.
pub trait Connection: Send + Sync {
    fn core(&self) -> &ConnectionCore;

    fn open(&self) -> BoxFuture<'_, io::Result<()>>;

    fn close(&self) -> BoxFuture<'_, io::Result<()>>;

    fn state(&self) -> ConnectionState {
        self.core().state()
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn events(&self) -> &ConnectionEvents {
        self.core().events()
    }

    fn set_swallow_errors(&self, value: bool) {
        self.core().set_swallow_errors(value);
    }

    fn wait_until_connected(&self) -> BoxFuture<'_, ()> {
        self.core().wait_until_connected().boxed()
    }

    fn wait_until_not_connected(&self) -> BoxFuture<'_, ()> {
        self.core().wait_until_not_connected().boxed()
    }

    /// Funnel for read/write failures. With `swallow_errors` set the error
    /// is logged and the connection is closed; otherwise it propagates to
    /// the caller.
    fn handle_error(&self, error: io::Error) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.core().swallows_errors() {
                warn!(error = %error, "connection error swallowed, closing");
                let _ = self.close().await;
                Ok(())
            } else {
                Err(error)
            }
        })
    }
}

/// An in-process connection with scriptable behaviour.
///
/// Used by the `fake_connections` extension and by tests: opening can be
/// made to fail a number of times, and an established link can be dropped
/// as if the peer had closed it.
pub struct DummyConnection {
    core: Arc<ConnectionCore>,
    fail_opens_remaining: AtomicUsize,
}

impl DummyConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(ConnectionCore::new()),
            fail_opens_remaining: AtomicUsize::new(0),
        })
    }

    /// Makes the next `count` open attempts fail with `ConnectionRefused`.
    pub fn fail_next_opens(&self, count: usize) {
        self.fail_opens_remaining.store(count, Ordering::SeqCst);
    }

    /// Simulates the peer dropping the link.
    pub fn drop_link(&self) {
        if self.core.state() == ConnectionState::Connected {
            self.core.set_state(ConnectionState::Disconnected);
        }
    }

    fn take_scripted_failure(&self) -> bool {
        self.fail_opens_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }
}

impl Connection for DummyConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn open(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            match self.core.state() {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                _ => {}
            }
            self.core.set_state(ConnectionState::Connecting);
            if self.take_scripted_failure() {
                self.core.set_state(ConnectionState::Disconnected);
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "scripted open failure",
                ));
            }
            self.core.set_state(ConnectionState::Connected);
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
            self.core.set_state(ConnectionState::Disconnected);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn record_states(conn: &dyn Connection) -> (Arc<StdMutex<Vec<StateChange>>>, crate::signals::SignalBinding) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let binding = {
            let seen = Arc::clone(&seen);
            conn.events()
                .state_changed
                .connect(move |change| seen.lock().unwrap().push(*change))
        };
        (seen, binding)
    }

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let conn = DummyConnection::new();
        let (seen, _binding) = record_states(conn.as_ref());

        conn.open().await.unwrap();
        conn.close().await.unwrap();

        let seen = seen.lock().unwrap();
        let path: Vec<(ConnectionState, ConnectionState)> =
            seen.iter().map(|change| (change.old, change.new)).collect();
        assert_eq!(
            path,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
                (ConnectionState::Connected, ConnectionState::Disconnecting),
                (ConnectionState::Disconnecting, ConnectionState::Disconnected),
            ]
        );
        // No state repeated consecutively.
        assert!(seen.iter().all(|change| change.old != change.new));
    }

    #[tokio::test]
    async fn connected_and_disconnected_are_paired() {
        let conn = DummyConnection::new();
        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));

        let _up = {
            let ups = Arc::clone(&ups);
            conn.events().connected.connect(move |_| {
                ups.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _down = {
            let downs = Arc::clone(&downs);
            conn.events().disconnected.connect(move |_| {
                downs.fetch_add(1, Ordering::SeqCst);
            })
        };

        for _ in 0..3 {
            conn.open().await.unwrap();
            conn.close().await.unwrap();
        }
        // A failed open produces no connected signal.
        conn.fail_next_opens(1);
        assert!(conn.open().await.is_err());

        assert_eq!(ups.load(Ordering::SeqCst), 3);
        assert_eq!(downs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_and_close_are_idempotent() {
        let conn = DummyConnection::new();
        conn.close().await.unwrap();
        conn.open().await.unwrap();
        conn.open().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wait_until_connected_returns_immediately_when_connected() {
        let conn = DummyConnection::new();
        conn.open().await.unwrap();
        conn.wait_until_connected().await;

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.wait_until_not_connected().await })
        };
        conn.close().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn handle_error_swallows_when_asked() {
        let conn = DummyConnection::new();
        conn.open().await.unwrap();

        let error = io::Error::new(io::ErrorKind::BrokenPipe, "boom");
        assert!(conn.handle_error(error).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.set_swallow_errors(true);
        let error = io::Error::new(io::ErrorKind::BrokenPipe, "boom");
        conn.handle_error(error).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
