//! Meta-task schedulers.
//!
//! Pipeline stages never block worker threads. When a queue has drainable
//! work it hands a [`MetaTask`] to a [`Scheduler`], which runs it on some
//! thread later. [`WorkerPool`] runs meta-tasks on a fixed set of threads
//! fed by a crossbeam channel. [`ManualScheduler`] queues them until the
//! owner calls [`ManualScheduler::run_until_idle`], which gives tests a
//! deterministic interleaving.

use std::collections::VecDeque;
use std::fmt;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Deferred unit of pipeline work.
pub type MetaTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs meta-tasks.
pub trait Scheduler: Send + Sync {
    /// Run `task` at some later point. Never blocks.
    fn spawn(&self, task: MetaTask);
}

// ── WorkerPool ─────────────────────────────────────────────────────

/// Fixed pool of worker threads draining a shared task channel.
pub struct WorkerPool {
    tx: Mutex<Option<Sender<MetaTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
}

impl WorkerPool {
    /// Start `count` workers. Zero is raised to one.
    pub fn new(count: usize) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<MetaTask>();
        let mut workers = Vec::with_capacity(count.max(1));
        for i in 0..count.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-meta-{i}"))
                .spawn(move || worker_loop(rx))?;
            workers.push(handle);
        }
        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();
        debug!(workers = workers.len(), "meta-task pool started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            worker_ids,
        })
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_ids.len()
    }

    /// Stop accepting work and join the workers once queued work is done.
    ///
    /// Called from a worker thread, the join is skipped; the workers exit
    /// on their own once the channel drains.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if self.worker_ids.contains(&thread::current().id()) {
            return;
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for w in workers {
            let _ = w.join();
        }
    }
}

fn worker_loop(rx: Receiver<MetaTask>) {
    while let Ok(task) = rx.recv() {
        task();
    }
    // Channel closed: every sender is gone.
}

impl Scheduler for WorkerPool {
    fn spawn(&self, task: MetaTask) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(task).is_err() {
                    trace!("meta-task dropped: pool stopped");
                }
            }
            None => trace!("meta-task dropped: pool stopped"),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_ids.len())
            .finish()
    }
}

// ── ManualScheduler ────────────────────────────────────────────────

/// Scheduler whose tasks run only when [`run_until_idle`](Self::run_until_idle)
/// is called.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<VecDeque<MetaTask>>,
}

impl ManualScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run queued tasks, including tasks they spawn, until none remain.
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Scheduler for ManualScheduler {
    fn spawn(&self, task: MetaTask) {
        self.tasks.lock().push_back(task);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn manual_runs_nested_spawns() {
        let s = Arc::new(ManualScheduler::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (s2, h) = (Arc::clone(&s), Arc::clone(&hits));
        s.spawn(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            let h = Arc::clone(&h);
            s2.spawn(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        assert_eq!(s.pending(), 1);
        assert_eq!(s.run_until_idle(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pool_runs_all_tasks_before_shutdown() {
        let pool = WorkerPool::new(3).unwrap();
        assert_eq!(pool.worker_count(), 3);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let h = Arc::clone(&hits);
            pool.spawn(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn spawn_after_shutdown_is_dropped() {
        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown();
        pool.spawn(Box::new(|| panic!("must not run")));
    }
}
