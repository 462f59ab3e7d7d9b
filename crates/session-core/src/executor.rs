//! ApplyQueue: the single-threaded apply context.
//!
//! Permission changes, membership mutations, and listener notifications
//! all funnel through one dedicated task so the editor/UI layer never
//! observes torn `User` or membership state. Submitters wait for their
//! job to finish; jobs run strictly in submission order.

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send>;

/// Single-threaded task executor for state-mutating jobs.
///
/// Must be created inside a tokio runtime. Dropping the queue shuts the
/// context down once the last submitted job has run.
pub struct ApplyQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl ApplyQueue {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }

    /// Run `job` on the apply context and wait for its result.
    pub async fn run<T, F>(&self, job: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                let _ = done_tx.send(job());
            }))
            .expect("apply context is gone");
        done_rx.await.expect("apply context dropped a job")
    }
}

impl Default for ApplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_returns_job_result() {
        let queue = ApplyQueue::new();
        let out = queue.run(|| 6 * 7).await;
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let queue = Arc::new(ApplyQueue::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..20 {
            let log = log.clone();
            queue.run(move || log.lock().unwrap().push(i)).await;
        }

        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_submitters_serialize() {
        let queue = Arc::new(ApplyQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let queue = queue.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let counter = counter.clone();
                    queue
                        .run(move || {
                            // Non-atomic read-modify-write is safe on the
                            // single apply task
                            let v = counter.load(Ordering::Relaxed);
                            counter.store(v + 1, Ordering::Relaxed);
                        })
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 400);
    }
}
