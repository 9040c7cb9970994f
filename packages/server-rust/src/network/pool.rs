//! Fixed-size worker pool fed by a bounded queue.
//!
//! Used instead of one task per connection when the acceptor is configured
//! with a pool size. Workers share the receiving end of an mpsc channel and
//! run one connection at a time each, so pool size caps concurrent handler
//! work while the queue absorbs bursts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// A unit of work: usually a whole connection loop.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Workers draining a shared bounded queue.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers behind a queue holding up to `queue_capacity` jobs.
    #[must_use]
    pub fn start(size: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break, // Queue closed and empty.
                        }
                    }
                    debug!(worker, "pool worker exiting");
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a free worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Queues a job, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has been shut down.
    pub async fn submit(&self, job: Job) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .await
                .map_err(|_| anyhow::anyhow!("worker pool closed")),
            None => Err(anyhow::anyhow!("worker pool not running")),
        }
    }

    /// Closes the queue and waits up to `timeout` for workers to finish
    /// queued and running jobs. Returns `false` if some were abandoned.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        self.tx.take();
        let workers = std::mem::take(&mut self.workers);
        tokio::time::timeout(timeout, async move {
            for worker in workers {
                let _ = worker.await;
            }
        })
        .await
        .is_ok()
    }
}
