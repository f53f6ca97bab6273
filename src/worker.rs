//! Worker pool — bounded concurrency for long-running broker jobs.
//!
//! W workers drain a shared FIFO queue of boxed jobs. Every job carries a
//! cancellation token tied to its owning task; cancelling the task makes
//! the worker abandon the job at its next await. When the queue is full,
//! submission blocks up to a grace period and then fails with `Overloaded`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

/// The kind of work a job represents; used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// A device tool invocation.
    DeviceToolInvoke,
    /// An outbound delegation to an external agent.
    AgentDelegate,
    /// An LLM analysis call.
    LlmCall,
    /// A push notification delivery.
    PushDelivery,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::DeviceToolInvoke => "device-tool-invoke",
            JobKind::AgentDelegate => "agent-delegate",
            JobKind::LlmCall => "llm-call",
            JobKind::PushDelivery => "push-delivery",
        };
        write!(f, "{}", s)
    }
}

struct Job {
    kind: JobKind,
    cancel: CancellationToken,
    fut: BoxFuture<'static, ()>,
}

/// Bounded FIFO worker pool with cooperative cancellation.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    grace: Duration,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` workers over a queue of depth `depth`.
    pub fn new(workers: usize, depth: usize, grace: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    // Take the queue lock only long enough to pop one job.
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(job) = job else { break };

                    if job.cancel.is_cancelled() {
                        debug!(worker_id, kind = %job.kind, "Skipping canceled job");
                        continue;
                    }

                    debug!(worker_id, kind = %job.kind, "Job started");
                    tokio::select! {
                        _ = job.cancel.cancelled() => {
                            debug!(worker_id, kind = %job.kind, "Job canceled mid-flight");
                        }
                        _ = job.fut => {
                            debug!(worker_id, kind = %job.kind, "Job finished");
                        }
                    }
                }
            });
        }

        Self {
            tx,
            grace,
            shutdown,
        }
    }

    /// Submit a job. Blocks up to the grace period when the queue is full,
    /// then fails with [`BrokerError::Overloaded`].
    pub async fn submit<F>(
        &self,
        kind: JobKind,
        cancel: CancellationToken,
        fut: F,
    ) -> BrokerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut job = Job {
            kind,
            cancel,
            fut: fut.boxed(),
        };

        match self.tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(BrokerError::Overloaded("worker pool is shut down".into()))
            }
            Err(mpsc::error::TrySendError::Full(returned)) => job = returned,
        }

        warn!(kind = %job.kind, "Worker queue full, waiting out the grace period");
        match tokio::time::timeout(self.grace, self.tx.send(job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::Overloaded("worker pool is shut down".into())),
            Err(_) => Err(BrokerError::Overloaded(format!(
                "worker queue stayed full for {:?}",
                self.grace
            ))),
        }
    }

    /// Stop the workers. Queued jobs that have not started are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn jobs_run_to_completion() {
        let pool = WorkerPool::new(2, 8, Duration::from_millis(100));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(JobKind::LlmCall, CancellationToken::new(), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn full_queue_times_out_as_overloaded() {
        // One worker stuck on a long job, queue depth 1.
        let pool = WorkerPool::new(1, 1, Duration::from_millis(50));
        let hold = CancellationToken::new();

        let hold_clone = hold.clone();
        pool.submit(JobKind::DeviceToolInvoke, CancellationToken::new(), async move {
            hold_clone.cancelled().await;
        })
        .await
        .unwrap();

        // Fill the single queue slot.
        pool.submit(JobKind::DeviceToolInvoke, CancellationToken::new(), async {})
            .await
            .unwrap();

        // The next submission cannot be queued within the grace period.
        let err = pool
            .submit(JobKind::DeviceToolInvoke, CancellationToken::new(), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Overloaded(_)));

        hold.cancel();
    }

    #[tokio::test]
    async fn cancellation_releases_the_worker() {
        let pool = WorkerPool::new(1, 4, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicUsize::new(0));

        // A job that would block forever without cancellation.
        pool.submit(JobKind::DeviceToolInvoke, cancel.clone(), async {
            std::future::pending::<()>().await;
        })
        .await
        .unwrap();

        cancel.cancel();

        // The worker must pick up the next job promptly.
        let finished_clone = Arc::clone(&finished);
        pool.submit(JobKind::LlmCall, CancellationToken::new(), async move {
            finished_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_canceled_jobs_are_skipped() {
        let pool = WorkerPool::new(1, 4, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        pool.submit(JobKind::PushDelivery, cancel, async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
