//! Bounded, deduplicating work queue.
//!
//! A key sits in the channel at most once (`dirty`), and is never handed out
//! while a worker still holds it (`processing`). A key re-added during
//! processing is queued again on `done`. Failed keys back off exponentially
//! per key until `forget`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BASE_DELAY_MS: u64 = 5;
const MAX_DELAY_MS: u64 = 1_000_000;

/// Per-key backoff: 5ms doubling per consecutive failure, capped at 1000s.
pub fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(40);
    let ms = BASE_DELAY_MS.saturating_mul(1u64 << exp).min(MAX_DELAY_MS);
    Duration::from_millis(ms)
}

#[derive(Default)]
struct QueueState {
    dirty: FxHashSet<String>,
    processing: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    dropped: u64,
}

struct Inner {
    name: String,
    tx: mpsc::Sender<String>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    state: Mutex<QueueState>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn with_capacity(name: impl Into<String>, cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(cap.max(1));
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                state: Mutex::new(QueueState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn add(&self, key: &str) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let Ok(mut st) = self.inner.state.lock() else { return };
        if !st.dirty.insert(key.to_string()) {
            return;
        }
        if st.processing.contains(key) {
            return;
        }
        self.enqueue(&mut st, key);
    }

    /// Add `key` once `delay` has elapsed, unless the queue shuts down first.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let q = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = q.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => q.add(&key),
            }
        });
    }

    pub fn add_rate_limited(&self, key: &str) {
        let failures = {
            let Ok(mut st) = self.inner.state.lock() else { return };
            let n = st.failures.entry(key.to_string()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = backoff_for(failures);
        debug!(queue = %self.inner.name, key = %key, failures, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &str) {
        if let Ok(mut st) = self.inner.state.lock() {
            st.failures.remove(key);
        }
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.state.lock().ok().and_then(|st| st.failures.get(key).copied()).unwrap_or(0)
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn next(&self) -> Option<String> {
        let mut rx = self.inner.rx.lock().await;
        let key = tokio::select! {
            _ = self.inner.shutdown.cancelled() => None,
            k = rx.recv() => k,
        }?;
        let mut st = self.inner.state.lock().ok()?;
        st.dirty.remove(&key);
        st.processing.insert(key.clone());
        Some(key)
    }

    /// Mark `key` finished; if it was re-added meanwhile it goes back in the channel.
    pub fn done(&self, key: &str) {
        let Ok(mut st) = self.inner.state.lock() else { return };
        st.processing.remove(key);
        if st.dirty.contains(key) && !self.inner.shutdown.is_cancelled() {
            self.enqueue(&mut st, key);
        }
    }

    pub fn shut_down(&self) {
        debug!(queue = %self.inner.name, "shutting down");
        self.inner.shutdown.cancel();
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().map(|st| st.dirty.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().map(|st| st.dropped).unwrap_or(0)
    }

    fn enqueue(&self, st: &mut QueueState, key: &str) {
        match self.inner.tx.try_send(key.to_string()) {
            Ok(()) => {}
            Err(e) => {
                st.dirty.remove(key);
                st.dropped += 1;
                counter!("work_queue_dropped_total", 1u64);
                warn!(queue = %self.inner.name, key = %key, error = %e, "work queue full; key dropped");
            }
        }
    }
}
