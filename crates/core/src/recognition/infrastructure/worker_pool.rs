use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("{0} queue is full")]
    Saturated(&'static str),
    #[error("{0} pool is shut down")]
    ShutDown(&'static str),
}

/// Fixed set of named worker threads fed from a bounded queue.
///
/// Submission never blocks: a full queue rejects the job. Once the shared
/// `cancelled` flag is set, workers discard whatever is still queued.
pub struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `size` workers over a queue of the same capacity.
    pub fn new(name: &'static str, size: usize, cancelled: Arc<AtomicBool>) -> std::io::Result<Self> {
        let size = size.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<Job>(size);

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let cancelled = cancelled.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    for job in rx {
                        if cancelled.load(Ordering::SeqCst) {
                            continue;
                        }
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            log::error!("{name} job panicked");
                        }
                    }
                })?;
            workers.push(handle);
        }
        log::info!("{name} pool started with {size} workers");

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            cancelled,
        })
    }

    /// True when a submission would be rejected right now.
    pub fn is_full(&self) -> bool {
        match &*self.sender.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(tx) => tx.is_full(),
            None => true,
        }
    }

    pub fn submit(&self, job: Job) -> Result<(), PoolError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown(self.name));
        }
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let tx = guard.as_ref().ok_or(PoolError::ShutDown(self.name))?;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated(self.name)),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown(self.name)),
        }
    }

    /// Closes the queue and joins every worker. Idempotent.
    ///
    /// Callers set the shared `cancelled` flag first so queued jobs are
    /// dropped instead of run.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("{} worker exited abnormally", self.name);
            }
        }
        log::info!("{} pool stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
