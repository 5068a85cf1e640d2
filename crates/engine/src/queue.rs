//! Per-key work queue
//!
//! Dispatches for the same key run strictly one after another; distinct
//! keys run in parallel. Each key maps to the completion signal of the
//! most recently enqueued task; a new task waits on its predecessor's
//! signal (a dropped predecessor counts as done, so one failure never
//! poisons later work) and removes the map entry if it is still the tail
//! when it finishes.

use relay_core::{Error, Result, Scope};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Queue key for a message: `GLOBAL` for account-wide flushes, otherwise
/// one lane per product symbol.
pub fn queue_key(scope: Scope, product_symbol: Option<&str>) -> String {
    match (scope, product_symbol) {
        (Scope::All, _) => "GLOBAL".to_string(),
        (Scope::Symbol, Some(symbol)) => format!("SYM:{}", symbol.to_ascii_uppercase()),
        (Scope::Symbol, None) => "GLOBAL".to_string(),
    }
}

struct Tail {
    done_rx: oneshot::Receiver<()>,
    seq: u64,
}

/// Map of queue key to the tail of its task chain
pub struct KeyedQueue {
    tails: Arc<Mutex<HashMap<String, Tail>>>,
    next_seq: AtomicU64,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self {
            tails: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Chain `task` behind the current tail for `key`. The place in the
    /// chain is claimed synchronously; the returned receiver yields the
    /// task's result once it has run.
    pub fn submit<T, F>(&self, key: &str, task: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let prev = {
            let mut tails = lock(&self.tails);
            tails
                .insert(key.to_string(), Tail { done_rx, seq })
                .map(|tail| tail.done_rx)
        };

        let tails = Arc::clone(&self.tails);
        let key_owned = key.to_string();
        tokio::spawn(async move {
            if let Some(prev) = prev {
                // A dropped sender means the predecessor failed or panicked;
                // either way this task may proceed
                let _ = prev.await;
            }

            let _ = result_tx.send(task.await);
            let _ = done_tx.send(());

            let mut tails = lock(&tails);
            if tails.get(&key_owned).map(|t| t.seq) == Some(seq) {
                tails.remove(&key_owned);
                debug!("Queue lane {} drained", key_owned);
            }
        });

        result_rx
    }

    /// Run `task` serialized behind all previously enqueued work for `key`
    pub async fn run<T, F>(&self, key: &str, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.submit(key, task)
            .await
            .map_err(|_| Error::Internal("queued task aborted".to_string()))
    }

    /// Number of keys with in-flight work
    pub fn active_lanes(&self) -> usize {
        lock(&self.tails).len()
    }
}

impl Default for KeyedQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<'a, T>(mutex: &'a Arc<Mutex<T>>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_queue_key_derivation() {
        assert_eq!(queue_key(Scope::All, Some("ARCUSD")), "GLOBAL");
        assert_eq!(queue_key(Scope::Symbol, Some("arcusd")), "SYM:ARCUSD");
        assert_eq!(queue_key(Scope::Symbol, None), "GLOBAL");
    }

    #[tokio::test]
    async fn test_same_key_runs_in_submission_order() {
        let queue = KeyedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..5u64 {
            let log = Arc::clone(&log);
            receivers.push(queue.submit("SYM:ARCUSD", async move {
                // The slowest task goes first: order must still hold
                tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                log.lock().unwrap().push(i);
            }));
        }
        for rx in receivers {
            rx.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_in_parallel() {
        let queue = KeyedQueue::new();
        let (slow_tx, slow_rx) = oneshot::channel::<()>();

        let slow = queue.submit("SYM:BTCUSD", async move {
            let _ = slow_rx.await;
        });

        // The other lane completes while the first is still blocked
        queue.run("SYM:ETHUSD", async {}).await.unwrap();

        let _ = slow_tx.send(());
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_the_lane() {
        let queue = KeyedQueue::new();

        let failed: Result<()> = queue
            .run("SYM:ARCUSD", async {
                panic!("boom");
            })
            .await;
        assert!(failed.is_err());

        let value = queue.run("SYM:ARCUSD", async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_drained_lane_is_removed() {
        let queue = KeyedQueue::new();
        queue.run("SYM:ARCUSD", async {}).await.unwrap();
        // Cleanup runs right after the result is delivered
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.active_lanes(), 0);
    }
}
