//! Bounded Worker Pool
//!
//! Runs background writes for async-mode writers. The pool starts
//! `min_threads` core workers fed from a bounded queue. When the queue is
//! full it grows up to `max_threads` with overflow workers that exit once the
//! queue stays empty for `keep_alive`; past that, the [`RejectionPolicy`]
//! decides what happens to the submission.
//!
//! Every task carries a state machine so it can be cancelled while queued.
//! A task that has started is never interrupted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tuning::PoolSizing;

/// What to do with a submission when the queue is full and no more threads
/// may be started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionPolicy {
    /// Fail the submission with `Error::Rejected`
    #[default]
    Abort,
    /// Block the submitting thread until a queue slot frees up
    Block,
    /// Drop the task, count it and log a warning
    Discard,
}

/// What happens to tasks still queued when the pool shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Queued tasks never run; they are counted as abandoned
    #[default]
    Discard,
    /// Queued tasks run to completion before the pool terminates
    Drain,
}

/// Lifecycle of one submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    /// Cancelled through its handle before it started
    Cancelled,
    /// Still queued when the pool shut down with `ShutdownPolicy::Discard`
    Abandoned,
    /// Refused at submission by the rejection policy
    Rejected,
    /// The task body panicked
    Panicked,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

struct TaskState {
    status: Mutex<TaskStatus>,
    changed: Condvar,
}

impl TaskState {
    fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Queued),
            changed: Condvar::new(),
        }
    }

    /// Move out of `Queued`; false if something else got there first
    fn leave_queue(&self, to: TaskStatus) -> bool {
        let mut status = self.status.lock();
        if *status != TaskStatus::Queued {
            return false;
        }
        *status = to;
        self.changed.notify_all();
        true
    }

    fn finish(&self, to: TaskStatus) {
        *self.status.lock() = to;
        self.changed.notify_all();
    }
}

/// Handle to a submitted task
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// Cancel the task if it has not started yet.
    ///
    /// Returns true if this call prevented the task from running. A running
    /// task is left alone.
    pub fn cancel(&self) -> bool {
        self.state.leave_queue(TaskStatus::Cancelled)
    }

    pub fn status(&self) -> TaskStatus {
        *self.state.status.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Wait until the task reaches a final state; `None` on timeout
    pub fn wait(&self, timeout: Duration) -> Option<TaskStatus> {
        let deadline = Instant::now() + timeout;
        let mut status = self.state.status.lock();
        while !status.is_finished() {
            if self.state.changed.wait_until(&mut status, deadline).timed_out() {
                return status.is_finished().then_some(*status);
            }
        }
        Some(*status)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("status", &self.status())
            .finish()
    }
}

struct Job {
    state: Arc<TaskState>,
    body: Box<dyn FnOnce() + Send>,
}

/// Counters over the pool's lifetime
#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    cancelled: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub completed: u64,
    pub cancelled: u64,
    pub abandoned: u64,
    pub rejected: u64,
    pub panicked: u64,
}

/// Outcome of [`WorkerPool::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks that never ran because of `ShutdownPolicy::Discard`
    pub abandoned: u64,
    /// Workers still running when the wait gave up
    pub still_running: usize,
    /// The wait for running workers hit its deadline
    pub timed_out: bool,
}

struct Shared {
    name: String,
    sizing: PoolSizing,
    keep_alive: Duration,
    live: Mutex<usize>,
    exited: Condvar,
    discarding: AtomicBool,
    next_worker: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn run(&self, job: Job) {
        if self.discarding.load(Ordering::Acquire) {
            self.dispose(job);
            return;
        }

        if !job.state.leave_queue(TaskStatus::Running) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(job.body)) {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                job.state.finish(TaskStatus::Completed);
            }
            Err(_) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(pool = %self.name, "background task panicked");
                job.state.finish(TaskStatus::Panicked);
            }
        }
    }

    /// Account for a queued job that will not run
    fn dispose(&self, job: Job) {
        if job.state.leave_queue(TaskStatus::Abandoned) {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Decrements the live-thread count when a worker exits, even by panic
struct LiveGuard(Arc<Shared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut live = self.0.live.lock();
        *live -= 1;
        self.0.exited.notify_all();
    }
}

/// Fixed-bound thread pool with a bounded queue
pub struct WorkerPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    rejection: RejectionPolicy,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start a pool with `sizing.min_threads` core workers
    pub fn new(
        name: impl Into<String>,
        sizing: PoolSizing,
        keep_alive: Duration,
        rejection: RejectionPolicy,
    ) -> Result<Self> {
        if sizing.min_threads == 0 || sizing.queue_capacity == 0 {
            return Err(Error::Config(
                "worker pool needs at least one thread and one queue slot".into(),
            ));
        }

        let (sender, receiver) = channel::bounded(sizing.queue_capacity);
        let pool = Self {
            shared: Arc::new(Shared {
                name: name.into(),
                sizing: PoolSizing {
                    max_threads: sizing.max_threads.max(sizing.min_threads),
                    ..sizing
                },
                keep_alive,
                live: Mutex::new(0),
                exited: Condvar::new(),
                discarding: AtomicBool::new(false),
                next_worker: AtomicUsize::new(0),
                counters: Counters::default(),
            }),
            sender: Mutex::new(Some(sender)),
            receiver,
            rejection,
            handles: Mutex::new(Vec::new()),
        };

        for _ in 0..sizing.min_threads {
            *pool.shared.live.lock() += 1;
            pool.spawn(None, true)?;
        }

        tracing::debug!(
            pool = %pool.shared.name,
            min_threads = pool.shared.sizing.min_threads,
            max_threads = pool.shared.sizing.max_threads,
            queue_capacity = pool.shared.sizing.queue_capacity,
            "worker pool started"
        );

        Ok(pool)
    }

    /// Start a worker; the caller has already counted it in `live`
    fn spawn(&self, first: Option<Job>, core: bool) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let receiver = self.receiver.clone();
        let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);

        let spawned = std::thread::Builder::new()
            .name(format!("{}-worker-{}", shared.name, id))
            .spawn(move || {
                let guard = LiveGuard(shared);
                let shared = &guard.0;

                if let Some(job) = first {
                    shared.run(job);
                }

                loop {
                    let next = if core {
                        receiver.recv().ok()
                    } else {
                        match receiver.recv_timeout(shared.keep_alive) {
                            Ok(job) => Some(job),
                            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                                None
                            }
                        }
                    };

                    match next {
                        Some(job) => shared.run(job),
                        None => break,
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                let mut live = self.shared.live.lock();
                *live -= 1;
                self.shared.exited.notify_all();
                Err(Error::Io(e))
            }
        }
    }

    /// Start an overflow worker for `job` if below `max_threads`.
    ///
    /// Gives the job back when the pool is already at its ceiling.
    fn spawn_overflow(&self, job: Job) -> Result<Option<Job>> {
        {
            let mut live = self.shared.live.lock();
            if *live >= self.shared.sizing.max_threads {
                return Ok(Some(job));
            }
            *live += 1;
        }

        let state = Arc::clone(&job.state);
        self.spawn(Some(job), false).map(|()| None).map_err(|e| {
            tracing::warn!(pool = %self.shared.name, "failed to start overflow worker: {}", e);
            state.leave_queue(TaskStatus::Rejected);
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            e
        })
    }

    /// Submit a task.
    ///
    /// # Errors
    ///
    /// `Error::ClosedResource` after shutdown; `Error::Rejected` when the
    /// pool is saturated under `RejectionPolicy::Abort`.
    pub fn submit<F>(&self, task: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(Error::ClosedResource("worker pool"))?;

        let state = Arc::new(TaskState::new());
        let handle = TaskHandle {
            state: Arc::clone(&state),
        };
        let job = Job {
            state,
            body: Box::new(task),
        };

        let job = match sender.try_send(job) {
            Ok(()) => return Ok(handle),
            Err(TrySendError::Disconnected(_)) => return Err(Error::ClosedResource("worker pool")),
            Err(TrySendError::Full(job)) => job,
        };

        let job = match self.spawn_overflow(job)? {
            None => return Ok(handle),
            Some(job) => job,
        };

        match self.rejection {
            RejectionPolicy::Block => {
                sender
                    .send(job)
                    .map_err(|_| Error::ClosedResource("worker pool"))?;
                Ok(handle)
            }
            RejectionPolicy::Abort => {
                self.reject(&job);
                Err(Error::Rejected {
                    capacity: self.shared.sizing.queue_capacity,
                })
            }
            RejectionPolicy::Discard => {
                self.reject(&job);
                tracing::warn!(
                    pool = %self.shared.name,
                    capacity = self.shared.sizing.queue_capacity,
                    "worker queue full, task discarded"
                );
                Ok(handle)
            }
        }
    }

    fn reject(&self, job: &Job) {
        job.state.leave_queue(TaskStatus::Rejected);
        self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop accepting tasks and wait up to `timeout` for workers to exit.
    ///
    /// Tasks already running always finish. Under `ShutdownPolicy::Discard`
    /// tasks still queued are marked abandoned and never run; under
    /// `ShutdownPolicy::Drain` they run first.
    pub fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> ShutdownReport {
        let sender = self.sender.lock().take();
        let first_call = sender.is_some();
        drop(sender);

        if first_call && policy == ShutdownPolicy::Discard {
            self.shared.discarding.store(true, Ordering::Release);
            while let Ok(job) = self.receiver.try_recv() {
                self.shared.dispose(job);
            }
        }

        let deadline = Instant::now() + timeout;
        let still_running = {
            let mut live = self.shared.live.lock();
            while *live > 0 {
                if self.shared.exited.wait_until(&mut live, deadline).timed_out() {
                    break;
                }
            }
            *live
        };

        if still_running == 0 {
            for handle in self.handles.lock().drain(..) {
                let _ = handle.join();
            }
        }

        let report = ShutdownReport {
            abandoned: self.shared.counters.abandoned.load(Ordering::Relaxed),
            still_running,
            timed_out: still_running > 0,
        };

        if first_call {
            tracing::debug!(
                pool = %self.shared.name,
                ?policy,
                abandoned = report.abandoned,
                still_running = report.still_running,
                "worker pool shut down"
            );
        }

        report
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Worker threads currently alive
    pub fn live_threads(&self) -> usize {
        *self.shared.live.lock()
    }

    pub fn sizing(&self) -> PoolSizing {
        self.shared.sizing
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            completed: c.completed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the queue drains.
        self.sender.lock().take();
    }
}
