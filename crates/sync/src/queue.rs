//! Rate-limited work queue and the bounded worker pool draining it.
//!
//! One Work is processed to completion by one worker; parallelism exists
//! only across Works. Failed items come back after a per-item exponential
//! delay, successful ones reset their failure count.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flotilla_core::WorkRef;

use crate::reconciler::WorkReconciler;

#[derive(Debug, Clone)]
pub struct RequeuePolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(60),
        }
    }
}

impl RequeuePolicy {
    fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(32);
        let delay = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

#[derive(Default)]
struct QueueState {
    pending: FxHashSet<WorkRef>,
    failures: FxHashMap<WorkRef, u32>,
}

fn push(tx: &mpsc::UnboundedSender<WorkRef>, state: &Mutex<QueueState>, item: WorkRef) {
    let mut state = state.lock().unwrap();
    if !state.pending.insert(item.clone()) {
        return;
    }
    drop(state);
    let _ = tx.send(item);
}

pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkRef>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkRef>>,
    state: Arc<Mutex<QueueState>>,
    policy: RequeuePolicy,
}

impl WorkQueue {
    pub fn new(policy: RequeuePolicy) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            state: Arc::new(Mutex::new(QueueState::default())),
            policy,
        })
    }

    /// Add a Work identity. Duplicates of an item still waiting in the
    /// queue coalesce; an item currently being processed can be re-added.
    pub fn enqueue(&self, item: WorkRef) {
        push(&self.tx, &self.state, item);
    }

    /// Schedule the item to come back after its backoff delay.
    pub fn requeue_later(&self, item: WorkRef) {
        let failures = {
            let mut state = self.state.lock().unwrap();
            let entry = state.failures.entry(item.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = self.policy.delay(failures - 1);
        debug!(work = %item, failures, delay_ms = delay.as_millis() as u64, "requeueing work");
        let tx = self.tx.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            push(&tx, &state, item);
        });
    }

    /// Clear the failure history after a successful pass.
    pub fn reset(&self, item: &WorkRef) {
        self.state.lock().unwrap().failures.remove(item);
    }

    pub fn failures(&self, item: &WorkRef) -> u32 {
        self.state
            .lock()
            .unwrap()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    async fn next(&self) -> Option<WorkRef> {
        let mut rx = self.rx.lock().await;
        let item = rx.recv().await;
        drop(rx);
        if let Some(item) = &item {
            self.state.lock().unwrap().pending.remove(item);
        }
        item
    }
}

/// Spawn `workers` tasks pulling Work identities off the queue. Each worker
/// drains one Work to completion before returning for the next; errors send
/// the item through the rate-limited requeue path.
pub fn run_workers(
    queue: Arc<WorkQueue>,
    reconciler: Arc<WorkReconciler>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        item = queue.next() => {
                            let Some(item) = item else { break };
                            match reconciler.reconcile(&item).await {
                                Ok(()) => queue.reset(&item),
                                Err(err) => {
                                    warn!(work = %item, error = %err, "reconcile failed");
                                    queue.requeue_later(item);
                                }
                            }
                        }
                    }
                }
                debug!(worker, "worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> WorkRef {
        WorkRef {
            namespace: "flotilla-es-edge-1".into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn enqueue_coalesces_waiting_duplicates() {
        let queue = WorkQueue::new(RequeuePolicy::default());
        queue.enqueue(item("a"));
        queue.enqueue(item("a"));
        queue.enqueue(item("b"));

        assert_eq!(queue.next().await.unwrap(), item("a"));
        assert_eq!(queue.next().await.unwrap(), item("b"));

        // once dequeued, the same identity may be enqueued again
        queue.enqueue(item("a"));
        assert_eq!(queue.next().await.unwrap(), item("a"));
    }

    #[tokio::test]
    async fn requeue_backs_off_and_reset_clears() {
        let policy = RequeuePolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(50),
        };
        let queue = WorkQueue::new(policy);
        queue.requeue_later(item("a"));
        queue.requeue_later(item("a"));
        assert_eq!(queue.failures(&item("a")), 2);

        // both delayed enqueues coalesce into one delivery
        let first = queue.next().await.unwrap();
        assert_eq!(first, item("a"));

        queue.reset(&item("a"));
        assert_eq!(queue.failures(&item("a")), 0);
    }

    #[test]
    fn delay_is_exponential_with_cap() {
        let policy = RequeuePolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(35),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(35));
        assert_eq!(policy.delay(20), Duration::from_millis(35));
    }
}
