//! Worker pools able to host chain runs.
//!
//! A run occupies its worker from the first stage to the finalizer, so
//! executors must tolerate jobs that block for the whole duration of a
//! protocol exchange.

use std::{
    any::Any,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, LazyLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tokio::runtime::{Handle, Runtime};

/// A unit of work: one whole chain run.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Accepts jobs for asynchronous execution.
///
/// An executor that cannot run a job (shut down, saturated with a rejecting
/// policy, ...) simply drops it; the run's handle then resolves as aborted.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}

/// Runs jobs on the blocking thread pool of a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor bound to the runtime of the calling task.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        drop(self.handle.spawn_blocking(job));
    }
}

// Initialize the fallback runtime once.
static ASYNC_RT: LazyLock<Option<Runtime>> = LazyLock::new(GlobalExecutor::initialize_async_rt);

/// Uses the ambient Tokio runtime when there is one and a lazily built
/// fallback runtime otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalExecutor;

impl GlobalExecutor {
    /// Returns the fallback runtime if none was running on the background.
    pub(crate) fn initialize_async_rt() -> Option<Runtime> {
        if Handle::try_current().is_ok() {
            None
        } else {
            tracing::debug!("GlobalExecutor: creating fallback runtime");
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.enable_all().thread_name("stagechain-worker");
            if cfg!(debug_assertions) {
                builder.worker_threads(2).max_blocking_threads(8);
            }
            match builder.build() {
                Ok(rt) => Some(rt),
                Err(error) => {
                    tracing::error!(%error, "failed to build fallback runtime");
                    None
                }
            }
        }
    }
}

impl Executor for GlobalExecutor {
    fn execute(&self, job: Job) {
        if let Ok(handle) = Handle::try_current() {
            drop(handle.spawn_blocking(job));
        } else if let Some(rt) = &*ASYNC_RT {
            drop(rt.spawn_blocking(job));
        } else {
            tracing::error!("no runtime available, dropping job");
        }
    }
}

/// Fixed-size pool of dedicated threads.
///
/// Submission blocks while every worker is busy and the queue (one slot per
/// worker) is full, which gives callers backpressure.
pub struct WorkerPool {
    work_sender: Sender<Job>,
    work_receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(size: NonZeroUsize) -> std::io::Result<Self> {
        let size: usize = size.into();
        let (work_sender, work_receiver) = bounded::<Job>(size);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = work_receiver.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("stagechain-pool-{i}"))
                .spawn(move || worker_loop(receiver, shutdown))?;
            workers.push(handle);
        }

        tracing::debug!(pool_size = size, "created worker pool");
        Ok(Self {
            work_sender,
            work_receiver,
            workers,
            shutdown,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting work. Queued jobs that were not picked up yet are
    /// dropped, which resolves their runs as aborted. Runs already in progress
    /// complete normally.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        drain(&self.work_receiver);
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) {
        if self.shutdown.load(Ordering::SeqCst) {
            tracing::warn!("worker pool is shut down, dropping job");
            return;
        }
        if self.work_sender.send(job).is_err() {
            tracing::error!("all pool workers are gone, dropping job");
            return;
        }
        // shut down while we were sending, the workers may be gone already
        if self.shutdown.load(Ordering::SeqCst) {
            drain(&self.work_receiver);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            // workers may be in the middle of a long run, don't wait for them
            drop(handle);
        }
    }
}

fn worker_loop(receiver: Receiver<Job>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            drain(&receiver);
            break;
        }
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    tracing::error!(
                        panic = %panic_message(panic.as_ref()),
                        "pool worker caught panic"
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn drain(receiver: &Receiver<Job>) {
    let dropped = receiver.try_iter().count();
    if dropped > 0 {
        tracing::debug!(dropped, "dropped queued jobs on shutdown");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
