//! Task-parallel execution of simulation trials.
//!
//! Trials are independent units of work. An executor accepts boxed jobs; the
//! batch helper [`run_batch`] fans a batch out, waits for every job (the
//! caller blocks until the whole batch is done) and returns the results in
//! job index order, so aggregation never depends on completion order.
//!
//! [`WorkerPool`] is a small, bounded, thread-based pool. Dropping it closes
//! the queue and joins every worker, which makes its lifetime the scope of
//! whatever owns it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error};

use crate::error::ExecutorError;

/// A unit of work accepted by an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Abstract task-parallel executor.
pub trait TaskExecutor: Send + Sync {
    /// Queues a job. May block while the queue is full.
    fn submit(&self, job: Job) -> Result<(), ExecutorError>;

    /// Number of jobs that can run concurrently.
    fn parallelism(&self) -> usize;
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        job();
        Ok(())
    }

    fn parallelism(&self) -> usize {
        1
    }
}

/// Cooperative cancellation signal shared between a caller and running work.
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Jobs that have not started yet are skipped.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Worker pool sizing: never more workers than trials per batch.
#[must_use]
pub fn pool_size(path_sample: usize, max_workers: Option<usize>) -> usize {
    let available = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let mut size = available.min(path_sample);
    if let Some(max) = max_workers {
        size = size.min(max);
    }
    size.max(1)
}

/// Fixed-size pool of named worker threads fed by a bounded queue.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    /// Starts `workers` threads sharing a queue of `queue_capacity` jobs.
    pub fn start(workers: usize, queue_capacity: usize) -> Result<Self, ExecutorError> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut pool = Self {
            tx: Some(tx),
            workers: Vec::with_capacity(workers),
            queue_capacity,
        };

        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("normshap-trial-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(|e| ExecutorError::SpawnFailed {
                    message: e.to_string(),
                })?;
            pool.workers.push(handle);
        }

        debug!(workers, queue_capacity, "worker pool started");
        Ok(pool)
    }

    /// Maximum number of queued jobs.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn shutdown(&mut self) {
        // Workers drain queued jobs, then see the closed channel and exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("trial worker exited abnormally");
            }
        }
    }
}

impl TaskExecutor for WorkerPool {
    fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        let tx = self.tx.as_ref().ok_or(ExecutorError::Disconnected)?;
        tx.send(job).map_err(|_| ExecutorError::Disconnected)
    }

    fn parallelism(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let workers = self.workers.len();
        self.shutdown();
        debug!(workers, "worker pool released");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Keeps the most relevant failure of a batch: real failures win over
/// cancellations, then the lowest job index wins.
fn keep_first(slot: &mut Option<(usize, ExecutorError)>, index: usize, err: ExecutorError) {
    fn rank(e: &ExecutorError) -> u8 {
        u8::from(matches!(e, ExecutorError::Cancelled))
    }
    let replace = match slot.as_ref() {
        None => true,
        Some((i, current)) => (rank(&err), index) < (rank(current), *i),
    };
    if replace {
        *slot = Some((index, err));
    }
}

/// Runs `task(0..count)` on `executor` and returns the results in index order.
///
/// This is a barrier: it returns only after every submitted job reported
/// back. The first failing job aborts the jobs of the batch that have not
/// started yet, and the batch fails as a whole. Panics inside `task` are
/// caught and reported as [`ExecutorError::TrialPanicked`].
pub fn run_batch<T, F>(
    executor: &dyn TaskExecutor,
    count: usize,
    cancel: &CancelToken,
    task: F,
) -> Result<Vec<T>, ExecutorError>
where
    T: Send + 'static,
    F: Fn(usize) -> Result<T, ExecutorError> + Send + Sync + 'static,
{
    if cancel.is_cancelled() {
        return Err(ExecutorError::Cancelled);
    }

    let task = Arc::new(task);
    let abort = Arc::new(AtomicBool::new(false));
    // Nothing here is sized by `count`; slots grow as results arrive.
    let (tx, rx) = unbounded::<(usize, Result<T, ExecutorError>)>();

    let mut submitted = 0usize;
    let mut failure: Option<(usize, ExecutorError)> = None;
    for index in 0..count {
        let task = Arc::clone(&task);
        let abort_flag = Arc::clone(&abort);
        let cancel = cancel.clone();
        let tx = tx.clone();
        let job: Job = Box::new(move || {
            let result = if abort_flag.load(Ordering::SeqCst) || cancel.is_cancelled() {
                Err(ExecutorError::Cancelled)
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| task(index))).unwrap_or_else(|payload| {
                    Err(ExecutorError::TrialPanicked {
                        trial: index,
                        message: panic_message(payload.as_ref()),
                    })
                })
            };
            if result.is_err() {
                abort_flag.store(true, Ordering::SeqCst);
            }
            let _ = tx.send((index, result));
        });
        if let Err(err) = executor.submit(job) {
            abort.store(true, Ordering::SeqCst);
            failure = Some((index, err));
            break;
        }
        submitted += 1;
    }
    drop(tx);

    let mut slots: Vec<Option<T>> = Vec::new();
    for _ in 0..submitted {
        match rx.recv() {
            Ok((index, Ok(value))) => {
                if slots.len() <= index {
                    slots.resize_with(index + 1, || None);
                }
                slots[index] = Some(value);
            }
            Ok((index, Err(err))) => keep_first(&mut failure, index, err),
            Err(_) => {
                keep_first(&mut failure, usize::MAX, ExecutorError::Disconnected);
                break;
            }
        }
    }

    if let Some((_, err)) = failure {
        return Err(err);
    }
    if slots.len() != count {
        return Err(ExecutorError::Disconnected);
    }
    slots
        .into_iter()
        .collect::<Option<Vec<T>>>()
        .ok_or(ExecutorError::Disconnected)
}
