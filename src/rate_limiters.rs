//! Rate limiters for high-frequency notifications.
//!
//! Both limiters follow the same law: when nothing was dispatched in the
//! last `delay` seconds, the next request goes out immediately; requests
//! arriving during the grace window after a dispatch are collected and go
//! out merged (sorted, duplicates removed) at the end of the window. A
//! burst therefore produces at most two dispatches: one at the start of
//! the window, one at its end.

use std::sync::Mutex;
use std::time::Duration;

use futures::Future;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rate limiter that batches requests of an arbitrary type.
///
/// Feed it with `add_request` from anywhere; `run` must be spawned once
/// and drives the dispatch function with the batched requests.
pub struct BatchRateLimiter<T> {
    name: &'static str,
    delay: Duration,
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T: Send + 'static> BatchRateLimiter<T> {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            delay,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Submits a request; never blocks. Requests submitted after `run`
    /// terminated are dropped.
    pub fn add_request(&self, request: T) {
        let _ = self.tx.send(request);
    }

    /// Drives the limiter. Consumes the receiving side, so this may only
    /// be called once.
    ///
    /// Every dispatched batch is merged: sorted with duplicates removed.
    pub async fn run<F, Fut>(&self, mut dispatch: F)
    where
        T: Ord,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            warn!(name = self.name, "rate limiter is already running");
            return;
        };

        'idle: while let Some(first) = rx.recv().await {
            // Idle for at least one full window: dispatch immediately,
            // together with whatever was submitted in the same breath.
            let mut batch = vec![first];
            while let Ok(request) = rx.try_recv() {
                batch.push(request);
            }
            dispatch(merge(batch)).await;

            // Grace window: collect everything that arrives within it.
            let deadline = Instant::now() + self.delay;
            let mut pending = Vec::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    request = rx.recv() => match request {
                        Some(request) => pending.push(request),
                        None => {
                            if !pending.is_empty() {
                                debug!(name = self.name, count = pending.len(),
                                    "flushing batched requests");
                                dispatch(merge(pending)).await;
                            }
                            break 'idle;
                        }
                    }
                }
            }
            if !pending.is_empty() {
                debug!(name = self.name, count = pending.len(), "flushing batched requests");
                dispatch(merge(pending)).await;
            }
        }
    }
}

fn merge<T: Ord>(mut batch: Vec<T>) -> Vec<T> {
    batch.sort();
    batch.dedup();
    batch
}

/// Rate limiter specialised for messages that carry a list of UAV ids:
/// a thin wrapper that flattens each id list into the generic limiter,
/// which merges the batched ids.
pub struct UavMessageRateLimiter {
    inner: BatchRateLimiter<String>,
}

impl UavMessageRateLimiter {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            inner: BatchRateLimiter::new(name, delay),
        }
    }

    pub fn add_request(&self, uav_ids: Vec<String>) {
        for uav_id in uav_ids {
            self.inner.add_request(uav_id);
        }
    }

    pub async fn run<F, Fut>(&self, dispatch: F)
    where
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.inner.run(dispatch).await;
    }
}
