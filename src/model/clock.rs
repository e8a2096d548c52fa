//! Clocks and timers the server exposes to its clients through the
//! `CLK-*` message family.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::signals::Signal;

/// Signals emitted by a clock. The clock registry re-dispatches all three
/// as a single generic `clock_changed` signal.
#[derive(Default)]
pub struct ClockEvents {
    pub started: Signal<()>,
    pub stopped: Signal<()>,
    /// The clock was adjusted (epoch or rate change).
    pub changed: Signal<()>,
}

/// A clock or timer managed by the server.
pub trait Clock: Send + Sync {
    fn id(&self) -> &str;

    /// The reference instant that tick zero corresponds to, if the clock
    /// has one.
    fn epoch(&self) -> Option<DateTime<Utc>>;

    fn ticks_per_second(&self) -> f64;

    /// Number of ticks elapsed at the given wall-clock time.
    fn ticks_given_time(&self, time: DateTime<Utc>) -> f64;

    fn running(&self) -> bool;

    fn events(&self) -> &ClockEvents;

    /// JSON status snapshot in the shape `CLK-INF` reports it.
    fn status(&self, now: DateTime<Utc>) -> Value {
        let mut status = json!({
            "id": self.id(),
            "retrievedAt": now.timestamp_millis(),
            "ticksPerSecond": self.ticks_per_second(),
            "running": self.running(),
            "ticks": self.ticks_given_time(now),
        });
        if let Some(epoch) = self.epoch() {
            status["epoch"] = json!(epoch.timestamp());
        }
        status
    }
}

/// The server's own clock: seconds since the Unix epoch, always running.
pub struct SystemClock {
    events: ClockEvents,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            events: ClockEvents::default(),
        }
    }
}

impl Clock for SystemClock {
    fn id(&self) -> &str {
        "system"
    }

    fn epoch(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(0, 0).single()
    }

    fn ticks_per_second(&self) -> f64 {
        1.0
    }

    fn ticks_given_time(&self, time: DateTime<Utc>) -> f64 {
        time.timestamp_millis() as f64 / 1000.0
    }

    fn running(&self) -> bool {
        true
    }

    fn events(&self) -> &ClockEvents {
        &self.events
    }
}
