//! The worker pool behind `multi_threaded` systems and the engine's
//! internal parallel passes (tile rasterization, batched culling).
//!
//! The pool is shaped around the one thing the tick loop actually does with
//! it: dispatch a *group* of borrowed tasks and block until every task in
//! the group has finished. There is no detached-task API and no futures;
//! [`WorkerPool::run_group`] is the whole surface. The blocking point at the
//! end of each dispatch is the scheduler's group-completion barrier.
//!
//! # How a dispatch runs
//!
//! ```text
//! run_group([t1, t2, t3, t4])
//!   │  push all tasks + wake workers
//!   ├─ worker A: t1, t4          ┐
//!   ├─ worker B: t2              │ shared injector queue
//!   └─ caller:   t3 (helps)      ┘
//!   └─ caller blocks until the group counter hits zero
//! ```
//!
//! The calling thread drains the queue alongside the workers instead of
//! idling, so a dispatch degrades gracefully on small machines: with one
//! worker (or a busy pool) the caller simply executes most of the group
//! itself. Several threads may dispatch groups concurrently; tasks carry
//! their own group handle, so helpers can safely execute tasks from a
//! foreign group while waiting for their own.
//!
//! Workers never hold store locks; between groups they sleep on a condvar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Default upper bound on worker threads.
pub const DEFAULT_MAX_THREADS: usize = 8;

/// A task after lifetime erasure; lives in the injector queue.
type RawTask = Box<dyn FnOnce() + Send + 'static>;

/// A borrowed task handed to [`WorkerPool::run_group`].
pub type GroupTask<'env> = Box<dyn FnOnce() + Send + 'env>;

/// Completion state for one dispatched group.
struct Group {
    remaining: Mutex<usize>,
    done: Condvar,
}

/// Decrements the group counter when a task finishes, even if it unwinds,
/// so a panicking task can never strand the dispatcher at the barrier.
struct Completion {
    group: Arc<Group>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let mut remaining = self
            .group
            .remaining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *remaining -= 1;
        if *remaining == 0 {
            self.group.done.notify_all();
        }
    }
}

struct Shared {
    queue: crossbeam::queue::SegQueue<RawTask>,
    /// Paired with `work_available`; workers recheck the queue under this
    /// lock before sleeping so a wake between check and wait cannot be lost.
    idle: Mutex<()>,
    work_available: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn wake_all(&self) {
        let _guard = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.work_available.notify_all();
    }
}

/// A fixed set of worker threads draining a shared task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// A pool with exactly `size` workers.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be greater than 0");

        let shared = Arc::new(Shared {
            queue: crossbeam::queue::SegQueue::new(),
            idle: Mutex::new(()),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..size)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        Self { shared, workers }
    }

    /// A pool sized to the hardware, clamped to `max_threads`.
    pub fn with_max_threads(max_threads: usize) -> Self {
        let hardware = thread::available_parallelism().map_or(1, |n| n.get());
        Self::new(hardware.min(max_threads.max(1)))
    }

    /// A pool with the default thread cap.
    pub fn default_pool() -> Self {
        Self::with_max_threads(DEFAULT_MAX_THREADS)
    }

    /// One worker; combined with the caller helping, this makes dispatches
    /// effectively deterministic for tests.
    pub fn single_threaded() -> Self {
        Self::new(1)
    }

    /// Number of worker threads.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run a group of tasks to completion.
    ///
    /// Tasks may borrow from the caller's stack: this call does not return
    /// until every task in the group has finished, which is also the
    /// scheduler's per-group barrier. The calling thread helps drain the
    /// queue while it waits.
    pub fn run_group<'env>(&self, tasks: Vec<GroupTask<'env>>) {
        if tasks.is_empty() {
            return;
        }

        let group = Arc::new(Group {
            remaining: Mutex::new(tasks.len()),
            done: Condvar::new(),
        });

        for task in tasks {
            let completion = Completion {
                group: Arc::clone(&group),
            };
            let wrapped: GroupTask<'env> = Box::new(move || {
                let _completion = completion;
                task();
            });
            // SAFETY: the erased borrows in `wrapped` stay valid because
            // this function blocks on the group counter below; no task of
            // this group can run after run_group returns.
            let wrapped: RawTask = unsafe { std::mem::transmute(wrapped) };
            self.shared.queue.push(wrapped);
        }
        self.shared.wake_all();

        // Help: execute queued tasks (ours or a concurrent dispatcher's)
        // instead of blocking immediately.
        while let Some(task) = self.shared.queue.pop() {
            execute(task);
        }

        // Barrier: tasks stolen by workers may still be in flight.
        let mut remaining = group
            .remaining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *remaining > 0 {
            remaining = group
                .done
                .wait(remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Run one task, containing any unwind: a panicking task must not kill its
/// worker or skip the dispatcher's barrier. The `Completion` guard inside
/// the task still fires on unwind.
fn execute(task: RawTask) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
        log::error!("worker pool task panicked");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        if let Some(task) = shared.queue.pop() {
            execute(task);
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let guard = shared
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Recheck under the lock: a push-and-wake that landed after the pop
        // above is observed here instead of being slept through.
        if !shared.queue.is_empty() || shared.shutdown.load(Ordering::Acquire) {
            continue;
        }
        let _guard = shared
            .work_available
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn run_group_executes_every_task() {
        // Given
        let pool = WorkerPool::new(4);
        let counter = AtomicUsize::new(0);

        // When
        let tasks: Vec<GroupTask<'_>> = (0..16)
            .map(|_| {
                let counter = &counter;
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as GroupTask<'_>
            })
            .collect();
        pool.run_group(tasks);

        // Then: the barrier held, all tasks ran
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn tasks_may_borrow_and_mutate_disjoint_data() {
        // Given
        let pool = WorkerPool::new(4);
        let mut data = vec![1, 2, 3, 4];

        // When: one task per element, each owning its &mut
        let tasks: Vec<GroupTask<'_>> = data
            .iter_mut()
            .map(|item| {
                Box::new(move || {
                    *item *= 2;
                }) as GroupTask<'_>
            })
            .collect();
        pool.run_group(tasks);

        // Then: completion is guaranteed before run_group returns
        assert_eq!(data, vec![2, 4, 6, 8]);
    }

    #[test]
    fn empty_group_returns_immediately() {
        let pool = WorkerPool::new(1);
        pool.run_group(Vec::new());
    }

    #[test]
    fn sequential_groups_observe_prior_effects() {
        // Given
        let pool = WorkerPool::new(2);
        let mut value = 0u32;

        // When: two dispatches in a row mutate the same place
        let slot = &mut value;
        pool.run_group(vec![Box::new(move || {
            *slot += 1;
        }) as GroupTask<'_>]);
        let slot = &mut value;
        pool.run_group(vec![Box::new(move || {
            *slot *= 10;
        }) as GroupTask<'_>]);

        // Then: the barrier orders them
        assert_eq!(value, 10);
    }

    #[test]
    fn caller_helps_when_workers_are_few() {
        // Given: one worker and many slow-ish tasks; the dispatching thread
        // must pitch in for this to finish promptly
        let pool = WorkerPool::single_threaded();
        let counter = AtomicUsize::new(0);

        let tasks: Vec<GroupTask<'_>> = (0..32)
            .map(|_| {
                let counter = &counter;
                Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as GroupTask<'_>
            })
            .collect();
        pool.run_group(tasks);

        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn concurrent_dispatchers_share_the_pool() {
        // Given: two threads dispatching their own groups into one pool
        let pool = Arc::new(WorkerPool::new(2));
        let totals: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let counter = AtomicUsize::new(0);
                    let tasks: Vec<GroupTask<'_>> = (0..50)
                        .map(|_| {
                            let counter = &counter;
                            Box::new(move || {
                                counter.fetch_add(1, Ordering::SeqCst);
                            }) as GroupTask<'_>
                        })
                        .collect();
                    pool.run_group(tasks);
                    counter.load(Ordering::SeqCst)
                })
            })
            .collect();

        // Then: each dispatcher's barrier covered exactly its own group
        for handle in totals {
            assert_eq!(handle.join().unwrap(), 50);
        }
    }

    #[test]
    fn panicking_task_does_not_strand_the_barrier() {
        // Given: a group whose middle task unwinds
        let pool = WorkerPool::new(2);
        let counter = AtomicUsize::new(0);

        let tasks: Vec<GroupTask<'_>> = (0..3)
            .map(|i| {
                let counter = &counter;
                Box::new(move || {
                    if i == 1 {
                        panic!("task failure");
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }) as GroupTask<'_>
            })
            .collect();

        // When: the dispatch completes anyway (the unwind is contained and
        // the group counter is decremented by the completion guard)
        pool.run_group(tasks);

        // Then: the surviving tasks ran and the pool is still usable
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let after = AtomicUsize::new(0);
        pool.run_group(vec![Box::new(|| {
            after.fetch_add(1, Ordering::SeqCst);
        }) as GroupTask<'_>]);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_max_threads_clamps() {
        let pool = WorkerPool::with_max_threads(2);
        assert!(pool.size() <= 2);
        assert!(pool.size() >= 1);
    }
}
