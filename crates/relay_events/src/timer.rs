//! Named, independently cancellable timers for a single connection.
//!
//! Every delayed action a connection schedules (rejoin, keepalive, CAP
//! fallback) lives in its own [`TimerSet`] keyed by purpose. The set is owned
//! by the connection task and dropped with it, so a replaced connection can
//! never receive a timer scheduled by its predecessor.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// A set of pending timers keyed by purpose.
///
/// When a timer fires its key is sent into the channel returned by
/// [`TimerSet::new`]; the owning task selects on that channel alongside its
/// socket and inbox.
pub struct TimerSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    tx: mpsc::UnboundedSender<K>,
    pending: HashMap<K, JoinHandle<()>>,
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Create a timer set and the channel its expiries arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: HashMap::new(),
            },
            rx,
        )
    }

    /// Arm (or re-arm) the timer for `key`. A previously scheduled timer for
    /// the same key is cancelled first.
    pub fn schedule(&mut self, key: K, delay: Duration) {
        if let Some(handle) = self.pending.remove(&key) {
            handle.abort();
        }
        trace!("Scheduling timer {:?} in {:?}", key, delay);
        let tx = self.tx.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the connection is already being torn down.
            let _ = tx.send(task_key);
        });
        self.pending.insert(key, handle);
    }

    /// Cancel the timer for `key` if armed. Returns whether one was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some(handle) => {
                let fired = handle.is_finished();
                handle.abort();
                !fired
            }
            None => false,
        }
    }

    /// Whether a timer for `key` is armed and has not fired yet.
    pub fn is_scheduled(&self, key: &K) -> bool {
        self.pending
            .get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}

impl<K> Drop for TimerSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel_all();
    }
}
