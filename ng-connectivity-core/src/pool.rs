use ng_connectivity_sdk::ConnectivityError;
use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed-size pool of workers, each draining its own bounded queue.
///
/// Jobs are distributed round-robin. A full queue applies back-pressure to the
/// submitter, or fails [`WorkerPool::try_submit`], instead of growing without bound.
/// Dropping the pool stops all workers.
pub struct WorkerPool<J> {
    name: String,
    senders: Vec<mpsc::Sender<J>>,
    next: AtomicUsize,
    shutdown_token: CancellationToken,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawns `size` workers (at least one) on the current runtime.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        size: usize,
        capacity: usize,
        parent: &CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(J) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let shutdown_token = parent.child_token();
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, mut rx) = mpsc::channel::<J>(capacity.max(1));
            let handler = handler.clone();
            let token = shutdown_token.clone();
            let worker_name = name.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        job = rx.recv() => match job {
                            Some(job) => handler(job).await,
                            None => break,
                        },
                    }
                }
                debug!(pool = %worker_name, worker = index, "Worker stopped");
            });
            senders.push(tx);
        }
        debug!(pool = %name, size, "Worker pool started");
        Self {
            name,
            senders,
            next: AtomicUsize::new(0),
            shutdown_token,
        }
    }

    pub async fn submit(&self, job: J) -> Result<(), ConnectivityError> {
        if self.shutdown_token.is_cancelled() {
            return Err(self.stopped());
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index].send(job).await.map_err(|_| self.stopped())
    }

    /// Queues `job` without waiting; a full queue is an error.
    pub fn try_submit(&self, job: J) -> Result<(), ConnectivityError> {
        if self.shutdown_token.is_cancelled() {
            return Err(self.stopped());
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index].try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectivityError::Internal {
                message: format!("worker pool '{}' is saturated", self.name),
            },
            mpsc::error::TrySendError::Closed(_) => self.stopped(),
        })
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn shutdown(&self) {
        if !self.shutdown_token.is_cancelled() {
            debug!(pool = %self.name, "Worker pool shutting down");
            self.shutdown_token.cancel();
        }
    }

    fn stopped(&self) -> ConnectivityError {
        ConnectivityError::Internal {
            message: format!("worker pool '{}' is stopped", self.name),
        }
    }
}

impl<J> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeSet, sync::Arc};
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn distributes_jobs_and_stops() {
        let seen = Arc::new(Mutex::new(BTreeSet::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let handler = {
            let seen = Arc::clone(&seen);
            move |job: u32| {
                let seen = Arc::clone(&seen);
                let done_tx = done_tx.clone();
                async move {
                    seen.lock().await.insert(job);
                    let _ = done_tx.send(());
                }
            }
        };
        let pool = WorkerPool::spawn("test", 3, 4, &CancellationToken::new(), handler);
        assert_eq!(pool.size(), 3);
        for job in 0..9 {
            pool.submit(job).await.unwrap();
        }
        for _ in 0..9 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(seen.lock().await.len(), 9);

        pool.shutdown();
        assert!(pool.submit(10).await.is_err());
    }

    #[tokio::test]
    async fn try_submit_fails_on_a_full_queue() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release = Arc::new(Mutex::new(Some(release_rx)));
        let handler = move |_: u32| {
            let release = Arc::clone(&release);
            async move {
                if let Some(rx) = release.lock().await.take() {
                    let _ = rx.await;
                }
            }
        };
        let pool = WorkerPool::spawn("busy", 1, 1, &CancellationToken::new(), handler);
        pool.submit(0).await.unwrap();
        tokio::task::yield_now().await;
        let mut rejected = false;
        for job in 1..4 {
            rejected |= pool.try_submit(job).is_err();
        }
        assert!(rejected);
        let _ = release_tx.send(());
    }
}
