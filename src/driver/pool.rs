//! Bounded worker pool serving forked sub-operations.

use std::thread::{Builder, JoinHandle};

use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads fed through a bounded channel.
///
/// When every worker is busy and the queue is full, `execute` runs the job
/// on the calling thread instead of blocking. Forked lookups may fan out
/// recursively through the pool, so blocking here could deadlock with all
/// workers waiting on jobs that cannot be queued.
pub struct WorkerPool {
    jobs: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> WorkerPool {
        let threads = threads.max(1);
        let (jobs, queue) = flume::bounded::<Job>(threads);

        let workers = (0..threads)
            .filter_map(|i| {
                let queue = queue.clone();
                Builder::new()
                    .name(format!("ringroute-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = queue.recv() {
                            job();
                        }
                    })
                    .ok()
            })
            .collect();

        WorkerPool {
            jobs: Some(jobs),
            workers,
        }
    }

    /// Run `job` on a worker, or inline when the pool is saturated or
    /// already shut down.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        let Some(jobs) = &self.jobs else {
            job();
            return;
        };

        match jobs.try_send(Box::new(job)) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(job)) | Err(flume::TrySendError::Disconnected(job)) => {
                trace!("worker pool saturated, running job inline");
                job();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain and exit.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
