//! Fixed-size pool of workers draining one bounded task queue.
//!
//! At most `size` tasks run at once. `submit` waits while the queue is full.
//! A panicking task is logged and the worker moves on to the next one.

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::errors::ServiceError;

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

type Task = BoxFuture<'static, ()>;

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `size` workers on the current runtime.
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Task>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker_id| tokio::spawn(Self::run_worker(worker_id, Arc::clone(&receiver))))
            .collect();

        info!(size, queue_capacity, "Worker pool started");
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    async fn run_worker(worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Task>>>) {
        loop {
            // The lock is only held while waiting for the next task.
            let task = { receiver.lock().await.recv().await };
            let Some(task) = task else {
                break;
            };
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                counter!("commerce.worker.panics", 1);
                error!(worker_id, "task panicked, worker continues");
            }
        }
        debug!(worker_id, "task queue closed, worker stopping");
    }

    /// Queues a task, waiting for room when the queue is full.
    pub async fn submit<F>(&self, task: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock().await.clone();
        let sender = sender.ok_or_else(|| {
            ServiceError::QueueError("worker pool is shut down".to_string())
        })?;
        sender
            .send(Box::pin(task))
            .await
            .map_err(|_| ServiceError::QueueError("worker pool is shut down".to_string()))
    }

    pub async fn is_shut_down(&self) -> bool {
        self.sender.lock().await.is_none()
    }

    /// Stops accepting tasks and waits until every queued task has run.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().await.take());

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
        info!("Worker pool drained");
    }
}
