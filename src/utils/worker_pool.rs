// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{AppError, AppResult};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker Pool Config Parameters
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of long-lived workers
    pub num_workers: usize,
    /// Job queue capacity, submitters wait once it is full
    pub queue_capacity: usize,
}

impl WorkerPoolConfig {
    /// `n` workers with a queue twice as deep.
    pub fn with_workers(n: usize) -> Self {
        Self {
            num_workers: n.max(1),
            queue_capacity: n.max(1) * 2,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::with_workers(num_cpus::get() * 10)
    }
}

/// Fixed set of workers draining a bounded job queue.
///
/// The queue decouples connection read loops from handler latency: when the
/// handlers fall behind, `submit` waits for a free slot, which in turn stops
/// the read loop from pulling more frames off the socket.
#[derive(Debug)]
pub struct WorkerPool {
    job_tx: async_channel::Sender<Job>,
    workers: Mutex<Vec<Worker>>,
    running: Arc<AtomicUsize>,
    drained: CancellationToken,
    config: WorkerPoolConfig,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawns the workers on the current tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let (job_tx, job_rx) = async_channel::bounded(config.queue_capacity.max(1));
        let running = Arc::new(AtomicUsize::new(0));

        let workers = (0..num_workers)
            .map(|id| Self::spawn_worker(id, job_rx.clone(), running.clone()))
            .collect();

        WorkerPool {
            job_tx,
            workers: Mutex::new(workers),
            running,
            drained: CancellationToken::new(),
            config,
        }
    }

    fn spawn_worker(
        id: usize,
        job_rx: async_channel::Receiver<Job>,
        running: Arc<AtomicUsize>,
    ) -> Worker {
        let handle = tokio::spawn(async move {
            debug!("Worker {} started", id);
            // recv only fails once the queue is closed and fully drained
            while let Ok(job) = job_rx.recv().await {
                running.fetch_add(1, Ordering::Relaxed);
                // a panicking job only takes down its own task
                let result = tokio::spawn(job).await;
                running.fetch_sub(1, Ordering::Relaxed);
                if let Err(err) = result {
                    log_job_failure(id, err);
                }
            }
            debug!("Worker {} exited", id);
        });
        Worker { id, handle }
    }

    /// Queues a job, waiting while the queue is full.
    pub async fn submit<F>(&self, job: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.job_tx
            .send(Box::pin(job))
            .await
            .map_err(|_| AppError::IllegalStateError("worker pool is shut down".into()))
    }

    /// Stops accepting jobs and waits until every queued and in-flight job
    /// has finished. Concurrent callers all return once the pool is drained.
    pub async fn shutdown(&self) {
        self.job_tx.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        if !workers.is_empty() {
            for worker in workers {
                if let Err(err) = worker.handle.await {
                    error!("Worker {} did not exit cleanly: {}", worker.id, err);
                }
            }
            debug!("worker pool drained");
            self.drained.cancel();
        }
        self.drained.cancelled().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.job_tx.is_closed()
    }

    /// Jobs currently executing.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Jobs waiting in the queue.
    pub fn pending(&self) -> usize {
        self.job_tx.len()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn log_status(&self) {
        info!(
            running = self.running(),
            pending = self.pending(),
            "[{}] jobs running, [{}] jobs pending",
            self.running(),
            self.pending()
        );
    }
}

fn log_job_failure(worker_id: usize, err: JoinError) {
    if !err.is_panic() {
        error!("Worker {worker_id} job was cancelled");
        return;
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("Worker {worker_id} job panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("Worker {worker_id} job panicked with message: {message}");
    } else {
        error!(
            "Worker {worker_id} job panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
