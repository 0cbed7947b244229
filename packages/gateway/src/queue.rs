//! Per-thread FIFO serialization: one mailbox and one worker per thread id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use flint_error::GatewayError;
use tokio::sync::{mpsc, oneshot, Mutex};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug)]
struct Worker {
    tx: mpsc::UnboundedSender<Task>,
    pending: usize,
}

/// Tasks submitted under the same key run in submission order and never
/// overlap; distinct keys run concurrently. The per-key worker exits and the
/// record is dropped as soon as its mailbox drains.
#[derive(Debug, Clone, Default)]
pub struct ThreadQueues {
    inner: Arc<Mutex<HashMap<String, Worker>>>,
}

impl ThreadQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<T, F>(&self, thread_id: &str, task: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Task = Box::pin(async move {
            let _ = tx.send(task.await);
        });
        self.submit(thread_id, wrapped).await;
        rx.await.map_err(|_| GatewayError::ClientClosed)
    }

    async fn submit(&self, thread_id: &str, task: Task) {
        let mut workers = self.inner.lock().await;
        let task = if let Some(worker) = workers.get_mut(thread_id) {
            worker.pending += 1;
            match worker.tx.send(task) {
                Ok(()) => return,
                Err(mpsc::error::SendError(task)) => {
                    // Worker died mid-flight; fall through and replace it.
                    workers.remove(thread_id);
                    task
                }
            }
        } else {
            task
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(task);
        workers.insert(thread_id.to_string(), Worker { tx, pending: 1 });
        drop(workers);

        let inner = self.inner.clone();
        let key = thread_id.to_string();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
                let mut workers = inner.lock().await;
                let drained = match workers.get_mut(&key) {
                    Some(worker) => {
                        worker.pending -= 1;
                        worker.pending == 0
                    }
                    None => true,
                };
                if drained {
                    workers.remove(&key);
                    return;
                }
            }
        });
    }

    #[cfg(test)]
    async fn active_keys(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_runs_in_submission_order() {
        let queues = ThreadQueues::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..8u64 {
            let queues = queues.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queues
                    .run("thread-a", async move {
                        // A later task finishing faster must still wait its turn.
                        tokio::time::sleep(Duration::from_millis(8 - index)).await;
                        log.lock().await.push(index);
                    })
                    .await
                    .unwrap();
            }));
            // Give the spawn a chance to submit before the next one.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = log.lock().await.clone();
        assert_eq!(log, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn same_key_never_overlaps() {
        let queues = ThreadQueues::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queues = queues.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                queues
                    .run("thread-a", async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_is_dropped_once_drained() {
        let queues = ThreadQueues::new();
        queues.run("thread-a", async {}).await.unwrap();
        // The worker removes itself after the oneshot resolves.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queues.active_keys().await, 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let queues = ThreadQueues::new();
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues
                    .run("thread-a", async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                    })
                    .await
                    .unwrap();
            })
        };

        started_rx.await.unwrap();
        // thread-b completes while thread-a is still blocked.
        queues.run("thread-b", async {}).await.unwrap();
        let _ = release_tx.send(());
        slow.await.unwrap();
    }
}
