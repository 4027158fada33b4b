//! Keyed debouncing on the tokio timer
//!
//! Scheduling a key again before its timer fires replaces the pending task,
//! so only the last call in a burst runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Reconciliation and bulk-load trigger window
pub const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Descriptor persistence window
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Default)]
struct Pending {
    next_id: u64,
    tasks: HashMap<String, (u64, JoinHandle<()>)>,
}

/// Timer-based coalescing queue. Pending timers are aborted on drop.
#[derive(Default)]
pub struct Debouncer {
    pending: Arc<Mutex<Pending>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `task` after `delay` unless `key` is scheduled or cancelled again
    /// first. Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: &str, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.lock();
        pending.next_id += 1;
        let id = pending.next_id;

        let registry = Arc::clone(&self.pending);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = registry.lock().unwrap_or_else(|e| e.into_inner());
                // A newer schedule or a cancel may have raced the timer.
                match pending.tasks.get(&owned_key) {
                    Some((current, _)) if *current == id => {
                        pending.tasks.remove(&owned_key);
                    }
                    _ => return,
                }
            }
            task().await;
        });

        if let Some((_, previous)) = pending.tasks.insert(key.to_string(), (id, handle)) {
            debug!("Debounced pending '{}' task", key);
            previous.abort();
        }
    }

    /// Cancel the pending task for `key`. Returns true if one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().tasks.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending task
    pub fn cancel_all(&self) {
        let mut pending = self.lock();
        for (key, (_, handle)) in pending.tasks.drain() {
            debug!("Cancelled pending '{}' task", key);
            handle.abort();
        }
    }

    /// Whether a task for `key` is waiting for its timer
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().tasks.contains_key(key)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
