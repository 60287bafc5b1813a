//! Fixed-size pool of decode threads.
//!
//! Jobs are boxed closures taken from a single FIFO queue. Stopping the
//! pool lets the workers finish everything already queued before they
//! exit, so no accepted job is ever dropped.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool needs at least one thread")]
    NoThreads,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker pool is stopped")]
    Stopped,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        if threads == 0 {
            return Err(PoolError::NoThreads);
        }

        let shared = Arc::new(Shared::default());
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };

        for index in 0..threads {
            let shared = Arc::clone(&pool.shared);
            // Already spawned workers are joined by Drop on error.
            let handle = thread::Builder::new()
                .name(format!("sniffer-worker-{index}"))
                .spawn(move || worker_loop(&shared))?;
            pool.workers.push(handle);
        }

        info!(threads, "Worker pool started");
        Ok(pool)
    }

    /// Queue a job for the next free worker.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return Err(PoolError::Stopped);
        }
        queue.jobs.push_back(Box::new(job));
        drop(queue);

        self.shared.available.notify_one();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopping
    }

    /// Refuse new jobs, drain the queue and join every worker.
    pub fn stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.stopping && self.workers.is_empty() {
                return;
            }
            queue.stopping = true;
            debug!(pending = queue.jobs.len(), "Draining worker pool");
        }
        self.shared.available.notify_all();

        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.stopping {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            let name = thread::current().name().unwrap_or("worker").to_string();
            error!(worker = %name, "Job panicked");
        }
    }
}
