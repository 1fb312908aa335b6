//! Single-worker serial task executor.
//!
//! Every operation that mutates shared host state (starting daemons, spawning
//! radio processes) is funnelled through one [`SerialExecutor`] so that
//! concurrently provisioned devices never race each other on the host. Work
//! runs on a dedicated thread in FIFO order; callers block on the returned
//! [`TaskHandle`] until their unit of work has executed.
//!
//! # Lifecycle
//!
//! `NotStarted -> Running -> Stopped`. Work submitted before `start()` is
//! queued and runs once the worker comes up. `stop()` joins the worker after
//! the task currently executing finishes; anything still queued is abandoned
//! and its waiters are released with [`ExecutorError::Abandoned`]. A stopped
//! executor cannot be restarted.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, OrchestratorError, Result};

/// Unique identifier of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Observable state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet picked up by the worker.
    Pending,
    /// Currently executing on the worker.
    Running,
    /// Finished and returned a value.
    Completed,
    /// Finished with an error or a panic.
    Failed,
    /// Dropped from the queue by `stop()` without running.
    Abandoned,
}

impl TaskState {
    /// Returns true once the task will never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }
}

struct TaskSlot<T> {
    state: TaskState,
    result: Option<Result<T>>,
}

struct TaskCell<T> {
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
}

impl<T> TaskCell<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(TaskSlot {
                state: TaskState::Pending,
                result: None,
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskSlot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_running(&self) {
        self.lock().state = TaskState::Running;
    }

    fn finish(&self, state: TaskState, result: Result<T>) {
        let mut slot = self.lock();
        slot.state = state;
        slot.result = Some(result);
        self.done.notify_all();
    }
}

/// Handle to a task submitted to a [`SerialExecutor`].
///
/// Clones share the same task. Any number of threads may block in
/// [`wait_done`](Self::wait_done); exactly one of them can take the result
/// with [`wait`](Self::wait).
pub struct TaskHandle<T> {
    id: TaskId,
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    /// Returns the task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the current task state without blocking.
    pub fn state(&self) -> TaskState {
        self.cell.lock().state
    }

    /// Blocks until the task reaches a terminal state and returns that state.
    pub fn wait_done(&self) -> TaskState {
        let mut slot = self.cell.lock();
        while !slot.state.is_terminal() {
            slot = self
                .cell
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slot.state
    }

    /// Blocks until the task has run, then returns its value or re-raises the
    /// error it produced.
    pub fn wait(self) -> Result<T> {
        self.wait_done();
        self.cell
            .lock()
            .result
            .take()
            .unwrap_or_else(|| Err(OrchestratorError::Executor(ExecutorError::ResultTaken)))
    }
}

trait QueuedTask: Send {
    fn id(&self) -> TaskId;
    fn run(self: Box<Self>);
    fn abandon(self: Box<Self>);
}

struct Job<T, F> {
    id: TaskId,
    work: F,
    cell: Arc<TaskCell<T>>,
}

impl<T, F> QueuedTask for Job<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(self: Box<Self>) {
        let Job { work, cell, .. } = *self;
        cell.mark_running();
        let result = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(payload) => Err(ExecutorError::Panicked(panic_message(payload)).into()),
        };
        let state = if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        cell.finish(state, result);
    }

    fn abandon(self: Box<Self>) {
        self.cell
            .finish(TaskState::Abandoned, Err(ExecutorError::Abandoned.into()));
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

struct QueueState {
    queue: VecDeque<Box<dyn QueuedTask>>,
    lifecycle: Lifecycle,
}

struct Shared {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs submitted work one unit at a time on a dedicated thread.
pub struct SerialExecutor {
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static GLOBAL: Lazy<Arc<SerialExecutor>> = Lazy::new(|| {
    let executor = Arc::new(SerialExecutor::new("homebed-executor"));
    if let Err(e) = executor.start() {
        error!(error = %e, "Failed to start global executor");
        executor.stop();
    }
    executor
});

impl SerialExecutor {
    /// Creates an executor that has not been started yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    lifecycle: Lifecycle::NotStarted,
                }),
                signal: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Creates and starts an executor.
    pub fn started(name: impl Into<String>) -> Result<Self> {
        let executor = Self::new(name);
        executor.start()?;
        Ok(executor)
    }

    /// Returns the process-wide executor, starting it on first use.
    pub fn global() -> Arc<SerialExecutor> {
        Arc::clone(&GLOBAL)
    }

    /// Returns the executor name (also the worker thread name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the worker thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.lock();
        match state.lifecycle {
            Lifecycle::Running => return Err(ExecutorError::AlreadyStarted.into()),
            Lifecycle::Stopped => return Err(ExecutorError::Stopped.into()),
            Lifecycle::NotStarted => {}
        }

        info!(executor = %self.name, "Starting serial executor");
        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_worker(&name, &shared))?;

        state.lifecycle = Lifecycle::Running;
        drop(state);
        // The worker may already be parked on the condvar.
        self.shared.signal.notify_one();

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(executor = %self.name, "Serial executor started");
        Ok(())
    }

    /// Queues `work` and returns immediately with a handle to its result.
    pub fn submit<T, F>(&self, work: F) -> std::result::Result<TaskHandle<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let id = TaskId::next();
        let cell = Arc::new(TaskCell::new());
        let job = Job {
            id,
            work,
            cell: Arc::clone(&cell),
        };

        let mut state = self.shared.lock();
        if state.lifecycle == Lifecycle::Stopped {
            return Err(ExecutorError::NotRunning);
        }
        state.queue.push_back(Box::new(job));
        let queued = state.queue.len();
        drop(state);

        self.shared.signal.notify_one();
        debug!(executor = %self.name, task = %id, queued, "Task sent to executor");
        Ok(TaskHandle { id, cell })
    }

    /// Submits `work` and blocks until it has run.
    pub fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.submit(work)?.wait()
    }

    /// Runs `work` on the worker, or on the calling thread when the executor
    /// no longer accepts work or the caller is the worker itself.
    ///
    /// Teardown uses this so that releasing host resources does not depend on
    /// the executor still being up.
    pub fn run_or_inline<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_running() && !self.on_worker() {
            self.run(work)
        } else {
            debug!(executor = %self.name, "Running teardown work inline");
            work()
        }
    }

    fn on_worker(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    /// Returns true while the worker accepts and runs work.
    pub fn is_running(&self) -> bool {
        self.shared.lock().lifecycle == Lifecycle::Running
    }

    /// Returns the number of queued tasks not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// The task currently executing (if any) finishes first. Queued tasks are
    /// abandoned. Calling `stop()` more than once is harmless.
    pub fn stop(&self) {
        let abandoned: Vec<Box<dyn QueuedTask>> = {
            let mut state = self.shared.lock();
            if state.lifecycle == Lifecycle::Stopped {
                return;
            }
            info!(executor = %self.name, "Stopping serial executor");
            state.lifecycle = Lifecycle::Stopped;
            state.queue.drain(..).collect()
        };
        self.shared.signal.notify_all();

        if !abandoned.is_empty() {
            warn!(executor = %self.name, count = abandoned.len(), "Abandoning queued tasks");
        }
        for task in abandoned {
            task.abandon();
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from inside a task: the worker exits once this task returns.
                return;
            }
            if handle.join().is_err() {
                error!(executor = %self.name, "Executor worker panicked");
            }
        }
        info!(executor = %self.name, "Serial executor stopped");
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("lifecycle", &state.lifecycle)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(name: &str, shared: &Shared) {
    info!(executor = %name, "Executor worker running");
    loop {
        let next = {
            let mut state = shared.lock();
            loop {
                if state.lifecycle == Lifecycle::Stopped {
                    break None;
                }
                if state.lifecycle == Lifecycle::Running {
                    if let Some(task) = state.queue.pop_front() {
                        break Some(task);
                    }
                }
                state = shared
                    .signal
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Some(task) = next else { break };
        let id = task.id();
        let started = Instant::now();
        task.run();
        debug!(
            executor = %name,
            task = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task handled"
        );
    }
    info!(executor = %name, "Executor worker stopped");
}
