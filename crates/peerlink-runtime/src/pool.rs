use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender, TrySendError};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why a job was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("queue full")]
    Full,
    #[error("pool shut down")]
    Closed,
}

/// Fixed set of threads draining a bounded FIFO queue.
///
/// Submission never blocks; a full queue rejects the job. A panicking job
/// is logged and the worker keeps going.
pub struct WorkerPool {
    name: &'static str,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, threads: usize, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = channel::bounded::<Job>(capacity.max(1));
        let workers = (0..threads.max(1))
            .map(|n| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{name}-{n}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                error!(pool = name, "job panicked");
                            }
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        debug!(pool = name, threads = workers.len(), capacity, "worker pool started");
        Ok(Self {
            name,
            tx: Some(tx),
            workers,
        })
    }

    pub fn try_execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), Rejected> {
        let tx = self.tx.as_ref().ok_or(Rejected::Closed)?;
        tx.try_send(Box::new(job)).map_err(|err| match err {
            TrySendError::Full(_) => Rejected::Full,
            TrySendError::Disconnected(_) => Rejected::Closed,
        })
    }

    /// Stop taking jobs. Queued jobs still run; workers exit once drained.
    ///
    /// With `join`, wait for the workers to finish.
    pub fn shutdown(&mut self, join: bool) {
        self.tx = None;
        let workers = std::mem::take(&mut self.workers);
        if join {
            for worker in workers {
                let _ = worker.join();
            }
        }
        debug!(pool = self.name, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx = None;
    }
}
