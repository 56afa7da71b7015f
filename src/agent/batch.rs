//! Batch aggregation of rapid-fire user messages.
//!
//! The first message of a burst opens a window; later messages in the same
//! session are stored and queued, and each one restarts the quiet period.
//! When the session has been quiet for `quiet` (or `max_wait` has passed
//! since the window opened) the waiting turn answers the whole burst with a
//! single model call.
//!
//! Only timers live here. Which messages are pending is always read back
//! from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::store::conversation::MessageRow;

type WaiterMap = HashMap<i64, Arc<Notify>>;

/// Per-session wake-up handles for turns currently waiting out a window.
#[derive(Clone, Default)]
pub struct BatchWaiters {
    inner: Arc<Mutex<WaiterMap>>,
}

impl BatchWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, WaiterMap> {
        // The map holds no invariants a panic could break.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the waiting turn of `session_id`. The registration is
    /// removed when the returned ticket is dropped.
    pub fn register(&self, session_id: i64) -> BatchTicket {
        let notify = Arc::new(Notify::new());
        self.map().insert(session_id, Arc::clone(&notify));
        BatchTicket {
            session_id,
            notify,
            waiters: self.clone(),
        }
    }

    /// Tell the waiting turn of `session_id` that another message arrived.
    /// Returns false when nobody in this process is waiting.
    pub fn notify(&self, session_id: i64) -> bool {
        match self.map().get(&session_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn is_waiting(&self, session_id: i64) -> bool {
        self.map().contains_key(&session_id)
    }
}

/// Registration handle held by the waiting turn.
pub struct BatchTicket {
    session_id: i64,
    notify: Arc<Notify>,
    waiters: BatchWaiters,
}

impl BatchTicket {
    /// Wait until the session has been quiet for `quiet`, or until
    /// `max_wait` has elapsed since this call. Returns the time waited.
    pub async fn wait_for_quiet(&self, quiet: Duration, max_wait: Duration) -> Duration {
        let started = Instant::now();
        let deadline = started + max_wait.max(quiet);
        let mut arrivals = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let window = quiet.min(deadline - now);
            match timeout(window, self.notify.notified()).await {
                Ok(()) => arrivals += 1,
                Err(_) => break,
            }
        }

        let waited = started.elapsed();
        debug!(
            "Batch window for session {} closed after {:?} ({} queued arrivals)",
            self.session_id, waited, arrivals
        );
        waited
    }
}

impl Drop for BatchTicket {
    fn drop(&mut self) {
        let mut map = self.waiters.map();
        if map
            .get(&self.session_id)
            .is_some_and(|n| Arc::ptr_eq(n, &self.notify))
        {
            map.remove(&self.session_id);
        }
    }
}

/// Merge the pending user messages of a burst into one block of text.
pub fn coalesce_pending(messages: &[MessageRow]) -> String {
    messages
        .iter()
        .map(|m| m.content.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
