//! A bounded worker pool whose queue drains newest-first.
//!
//! A user panning a map floods the queue with requests that are stale by
//! the time workers catch up; taking the most recent submission first keeps
//! what is on screen responsive. Queued tasks can be cancelled wholesale;
//! running tasks always finish, so a partially completed fetch still caches
//! its result.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, trace, warn};

use crate::config::PoolOptions;

/// Work the pool can run and, while still queued, cancel.
pub trait PoolTask: Send + Sync {
    /// Execute the task on a worker thread.
    fn run(&self);
    /// The task was removed from the queue before any worker picked it up.
    fn cancelled(&self);
}

struct PoolState {
    queue: Vec<Arc<dyn PoolTask>>,
    workers: usize,
    idle: usize,
    next_worker: usize,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    work_available: Condvar,
    options: PoolOptions,
}

/// Bounded executor with a LIFO queue.
///
/// Workers are spawned on demand up to `max_threads`; surplus workers
/// beyond `core_threads` exit after `keep_alive` of idleness. Dropping the
/// pool cancels everything still queued and lets workers drain.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with the given sizing.
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: Vec::new(),
                    workers: 0,
                    idle: 0,
                    next_worker: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                options,
            }),
        }
    }

    /// Enqueue a task; it will be taken before everything queued earlier.
    pub fn execute(&self, task: Arc<dyn PoolTask>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            drop(state);
            task.cancelled();
            return;
        }
        state.queue.push(task);
        let options = &self.inner.options;
        let wanted = state.workers < options.core_threads
            || (state.idle == 0 && state.workers < options.max_threads);
        if wanted {
            state.workers += 1;
            state.next_worker += 1;
            let name = format!("artifact-cache-worker-{}", state.next_worker);
            let inner = Arc::clone(&self.inner);
            if let Err(error) = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(&inner))
            {
                state.workers -= 1;
                warn!(%error, "failed to spawn worker");
            }
        }
        drop(state);
        self.inner.work_available.notify_one();
    }

    /// Remove every task still queued (not yet running) and notify each via
    /// [`PoolTask::cancelled`]. Returns how many were cancelled.
    pub fn cancel_outstanding(&self) -> usize {
        let drained = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.queue)
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelling queued tasks");
        }
        for task in &drained {
            task.cancelled();
        }
        drained.len()
    }

    /// Snapshot of how many tasks are waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let drained = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            std::mem::take(&mut state.queue)
        };
        for task in &drained {
            task.cancelled();
        }
        self.inner.work_available.notify_all();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("WorkerPool")
            .field("queued", &state.queue.len())
            .field("workers", &state.workers)
            .field("idle", &state.idle)
            .finish()
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    trace!("worker started");
    let mut state = inner.state.lock().unwrap();
    loop {
        // Taking from the tail makes the queue LIFO.
        if let Some(task) = state.queue.pop() {
            drop(state);
            task.run();
            state = inner.state.lock().unwrap();
            continue;
        }
        if state.shutdown {
            break;
        }
        state.idle += 1;
        let (guard, timeout) = inner
            .work_available
            .wait_timeout(state, inner.options.keep_alive)
            .unwrap();
        state = guard;
        state.idle -= 1;
        if state.queue.is_empty() {
            if state.shutdown {
                break;
            }
            if timeout.timed_out()
                && state.workers > inner.options.core_threads
            {
                trace!("surplus worker idled out");
                break;
            }
        }
    }
    state.workers -= 1;
}
