//! Deferred command queue bridging parallel systems to the main thread.
//!
//! Systems running on workers cannot mutate world structure or call the
//! host backends; instead they enqueue closures here. The main thread drains
//! the queue between phases and executes every command against `&mut World`
//! (which is also where the backends live), so backend handles never leave
//! the main thread.
//!
//! # Shape
//!
//! Commands are type-erased behind a two-entry vtable: `execute` and
//! `recycle`; and their storage comes from a fixed-capacity pool keyed by
//! the closure's concrete type. A drained command returns its allocation to
//! the pool instead of freeing it, so steady-state frames allocate nothing.
//!
//! # Contract
//!
//! - `enqueue` is lock-free for producers. On pool exhaustion it returns
//!   [`EnqueueResult::Dropped`]; callers must treat drops as soft errors.
//! - `drain` is single-consumer, main thread only. Execution order is FIFO
//!   *per producing thread*; cross-producer ordering is unspecified.
//! - `is_empty` is a best-effort hint and may under-report while producers
//!   are active.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;

use crate::ecs::world::World;

/// Default slots per closure type.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Outcome of [`CommandQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a Dropped command never executes; callers must tolerate it"]
pub enum EnqueueResult {
    Queued,
    /// The closure type's pool was exhausted; the command was discarded.
    Dropped,
}

impl EnqueueResult {
    #[inline]
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

/// The two-entry command vtable: run once, then return storage to the pool.
trait PooledCommand: Send {
    fn execute(&mut self, world: &mut World);
    fn recycle(self: Box<Self>, pools: &Pools);
}

/// Storage slot for one closure. Recycled slots sit in their type's freelist
/// with `func == None`.
struct Slot<F> {
    func: Option<F>,
}

impl<F> PooledCommand for Slot<F>
where
    F: FnOnce(&mut World) + Send + 'static,
{
    fn execute(&mut self, world: &mut World) {
        if let Some(func) = self.func.take() {
            func(world);
        }
    }

    fn recycle(self: Box<Self>, pools: &Pools) {
        pools.release::<F>(self);
    }
}

/// Fixed-capacity allocation pool for one closure type.
struct Pool {
    free: SegQueue<Box<dyn Any + Send>>,
    /// Slots minted so far; never exceeds `capacity`.
    allocated: AtomicUsize,
}

impl Pool {
    fn new() -> Self {
        Self {
            free: SegQueue::new(),
            allocated: AtomicUsize::new(0),
        }
    }
}

/// Per-closure-type freelists, keyed by `TypeId`.
struct Pools {
    by_type: DashMap<TypeId, Pool>,
    capacity: usize,
}

impl Pools {
    fn acquire<F>(&self, func: F) -> Option<Box<Slot<F>>>
    where
        F: FnOnce(&mut World) + Send + 'static,
    {
        // Read-path first so steady-state enqueues only touch the shard lock
        // for reading; the write path runs once per closure type.
        let pool = match self.by_type.get(&TypeId::of::<F>()) {
            Some(pool) => pool,
            None => self
                .by_type
                .entry(TypeId::of::<F>())
                .or_insert_with(Pool::new)
                .downgrade(),
        };

        if let Some(recycled) = pool.free.pop() {
            // The freelist only ever holds this type's slots.
            let mut slot = recycled
                .downcast::<Slot<F>>()
                .expect("command pool freelist holds a foreign slot type");
            slot.func = Some(func);
            return Some(slot);
        }

        // Mint a new slot unless the pool is at capacity. The counter may
        // transiently overshoot under contention; compensate and report
        // exhaustion.
        if pool.allocated.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            pool.allocated.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Box::new(Slot { func: Some(func) }))
    }

    fn release<F>(&self, slot: Box<Slot<F>>)
    where
        F: FnOnce(&mut World) + Send + 'static,
    {
        if let Some(pool) = self.by_type.get(&TypeId::of::<F>()) {
            pool.free.push(slot as Box<dyn Any + Send>);
        }
    }
}

/// Lock-free MPSC queue of deferred world/backend mutations.
pub struct CommandQueue {
    queue: SegQueue<Box<dyn PooledCommand>>,
    pools: Pools,
    len: AtomicUsize,
    dropped: AtomicUsize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            pools: Pools {
                by_type: DashMap::new(),
                capacity,
            },
            len: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Enqueue a deferred mutation. Lock-free; safe from any thread.
    pub fn enqueue<F>(&self, func: F) -> EnqueueResult
    where
        F: FnOnce(&mut World) + Send + 'static,
    {
        match self.pools.acquire(func) {
            Some(slot) => {
                self.queue.push(slot);
                self.len.fetch_add(1, Ordering::Relaxed);
                EnqueueResult::Queued
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueResult::Dropped
            }
        }
    }

    /// Execute every queued command. Single consumer; main thread only.
    ///
    /// Commands enqueued *during* the drain (by other commands) are executed
    /// in the same drain, so the queue is empty when this returns unless
    /// producers are still running, which the tick loop never allows.
    pub fn drain(&self, world: &mut World) -> usize {
        let mut executed = 0;
        while let Some(mut command) = self.queue.pop() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            command.execute(world);
            command.recycle(&self.pools);
            executed += 1;
        }
        executed
    }

    /// Best-effort emptiness hint; may under-report under concurrent
    /// enqueue.
    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Relaxed) == 0
    }

    /// Approximate queued command count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Commands discarded so far due to pool exhaustion.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
