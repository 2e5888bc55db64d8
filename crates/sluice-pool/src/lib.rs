//! # sluice-pool
//!
//! A fixed-size worker pool executing arbitrary unit tasks.
//!
//! The dispatcher submits operation thunks here. Workers run each task to
//! completion and may block in syscalls; submission never blocks the caller
//! and tasks are handed to workers in FIFO order.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads.
///
/// Dropping the pool closes the injection queue, lets the workers drain any
/// queued tasks, and joins them.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool of `workers` threads.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or a worker thread cannot be spawned.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker pool needs at least one worker");
        let (tx, rx) = unbounded::<Job>();
        let handles = (0..workers)
            .map(|n| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("sluice-worker-{n}"))
                    .spawn(move || Self::worker_loop(n, rx))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers: handles,
        }
    }

    fn worker_loop(n: usize, rx: Receiver<Job>) {
        trace!(worker = n, "worker started");
        while let Ok(job) = rx.recv() {
            // A panicking task must not take the worker down with it.
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(worker = n, "task panicked on worker thread");
            }
        }
        trace!(worker = n, "worker exiting");
    }

    /// Sends a task to the pool for execution.
    ///
    /// Returns immediately; the task runs on the next free worker.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        self.tx
            .as_ref()
            .expect("pool is shutting down")
            .send(Box::new(job))
            .expect("worker channel closed");
    }

    /// Sends a task to the pool and returns a handle to its result.
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let cell = Arc::new(TaskCell {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        let fulfil = Arc::clone(&cell);
        self.execute(move || {
            let out = f();
            *fulfil.slot.lock() = Some(out);
            fulfil.done.notify_all();
        });
        TaskHandle { cell }
    }

    /// The number of worker threads in this pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The pool can be dropped from inside a task when the last
            // owner is a queued closure; that worker exits on its own once
            // the channel closes and must not join itself.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

struct TaskCell<T> {
    slot: Mutex<Option<T>>,
    done: Condvar,
}

/// A handle to the result of a task submitted via [`WorkerPool::spawn`].
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes and returns its result.
    pub fn wait(self) -> T {
        let mut slot = self.cell.slot.lock();
        while slot.is_none() {
            self.cell.done.wait(&mut slot);
        }
        slot.take().expect("task cell fulfilled")
    }

    /// Returns the result if the task has already finished. A taken result
    /// is gone: `wait` afterwards would block forever.
    pub fn try_take(&self) -> Option<T> {
        self.cell.slot.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn spawn_returns_result() {
        let pool = WorkerPool::new(2);
        let handle = pool.spawn(|| 21 * 2);
        assert_eq!(handle.wait(), 42);
    }

    #[test]
    fn tasks_run_in_fifo_order_on_one_worker() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..16 {
            let order = Arc::clone(&order);
            pool.execute(move || order.lock().push(n));
        }
        pool.spawn(|| ()).wait();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn many_tasks_across_workers() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_pool() {
        let pool = WorkerPool::new(1);
        pool.execute(|| panic!("boom"));
        let handle = pool.spawn(|| 7);
        assert_eq!(handle.wait(), 7);
    }

    #[test]
    fn drop_joins_after_draining() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2);
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    thread::sleep(Duration::from_millis(5));
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn try_take_before_completion() {
        let pool = WorkerPool::new(1);
        let handle = pool.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            5
        });
        // Either not done yet or already done; wait() must still resolve.
        let _ = handle.try_take();
        let gate = pool.spawn(|| 1);
        assert_eq!(gate.wait(), 1);
    }
}
