//! System descriptors and their runtime state.
//!
//! A system is a named callable bound to a phase, with an optional run
//! interval, a `multi_threaded` flag, and a [`Filter`] describing the
//! entities it operates on. The pipeline invokes the callback once per
//! matched batch (at most [`BATCH_SIZE`](crate::ecs::query::BATCH_SIZE)
//! entities); a system whose filter has no terms still runs once per tick
//! with an empty batch.
//!
//! Systems are isolated from each other's failures: a panicking callback is
//! caught, the system is disabled for the remainder of the tick, and the
//! error is reported through `log`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::ecs::entity::Entity;
use crate::ecs::pipeline::PhaseId;
use crate::ecs::query::{Filter, Query};
use crate::ecs::world::World;

/// The callback signature: invoked once per batch.
pub type SystemFn = Arc<dyn Fn(&mut Iter<'_>) + Send + Sync + 'static>;

/// The execution window handed to a system callback: one batch of matched
/// entities plus scoped world access.
pub struct Iter<'w> {
    world: &'w World,
    entities: &'w [Entity],
    delta: f32,
    tick: u64,
}

impl<'w> Iter<'w> {
    pub(crate) fn new(world: &'w World, entities: &'w [Entity], delta: f32, tick: u64) -> Self {
        Self {
            world,
            entities,
            delta,
            tick,
        }
    }

    /// The entities of this batch, in iteration order.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        self.entities
    }

    /// Seconds since the previous tick.
    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta
    }

    /// The world being iterated (shared access).
    #[inline]
    pub fn world(&self) -> &World {
        self.world
    }

    /// The command queue for deferred mutations.
    #[inline]
    pub fn commands(&self) -> &crate::ecs::command::CommandQueue {
        self.world.commands()
    }

    /// Read a component. The column must be in the system's `read` or
    /// `write` set; the scheduler's grouping is what makes this safe while
    /// other systems run.
    #[inline]
    pub fn get<T: crate::ecs::component::Component>(&self, entity: Entity) -> Option<&T> {
        self.world.store().column(self.world.id_of::<T>()?)?.get(entity)
    }

    /// Mutate a component and stamp its change tick. The column must be in
    /// the system's declared `write` set.
    #[inline]
    pub fn get_mut<T: crate::ecs::component::Component>(&self, entity: Entity) -> Option<&mut T> {
        let id = self.world.id_of::<T>()?;
        // SAFETY: only this one column is touched. The scheduler never runs
        // two systems with overlapping write sets concurrently, so no other
        // thread reads or writes this column right now; batches within one
        // system are disjoint entity sets, so concurrent batch workers
        // mutate disjoint rows of it.
        let column = unsafe { &mut *self.world.store().column_mut_unchecked(id)? };
        column.get_mut(entity, self.tick)
    }
}

/// Declarative description of a system, built by the host or by the engine's
/// own subsystems and handed to `World::register_system`.
#[derive(Clone)]
pub struct SystemDesc {
    pub name: String,
    /// Phase name; resolved against the world's pipeline at registration.
    pub phase: String,
    /// If set, the system only runs when its accumulated time exceeds the
    /// interval (seconds).
    pub interval: Option<f32>,
    pub multi_threaded: bool,
    pub filter: Filter,
    pub run: SystemFn,
}

impl SystemDesc {
    pub fn new(name: impl Into<String>, run: impl Fn(&mut Iter<'_>) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            phase: crate::ecs::pipeline::phases::ON_UPDATE.to_string(),
            interval: None,
            multi_threaded: false,
            filter: Filter::new(),
            run: Arc::new(run),
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn interval(mut self, seconds: f32) -> Self {
        self.interval = Some(seconds);
        self
    }

    pub fn multi_threaded(mut self, yes: bool) -> Self {
        self.multi_threaded = yes;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}

/// Timing and activity counters for one system, served to the debugger.
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub time_usec: u64,
    pub call_count: u64,
    pub entity_count: u64,
    pub min_usec: u64,
    pub max_usec: u64,
}

impl SystemStats {
    fn record(&mut self, elapsed_usec: u64, entities: u64) {
        if self.call_count == 0 || elapsed_usec < self.min_usec {
            self.min_usec = elapsed_usec;
        }
        self.max_usec = self.max_usec.max(elapsed_usec);
        self.time_usec += elapsed_usec;
        self.call_count += 1;
        self.entity_count = entities;
    }
}

/// A registered system: descriptor plus scheduler state.
pub struct System {
    pub(crate) name: String,
    pub(crate) phase: PhaseId,
    pub(crate) interval: Option<f32>,
    pub(crate) multi_threaded: bool,
    pub(crate) query: Query,
    pub(crate) run: SystemFn,
    /// Interval budget; incremented by delta each tick.
    pub(crate) accumulator: f32,
    /// Host-controlled pause flag.
    pub(crate) paused: bool,
    /// Set when the callback panicked this tick; cleared at tick start.
    pub(crate) failed: bool,
    pub(crate) stats: SystemStats,
}

impl System {
    pub(crate) fn new(desc: SystemDesc, phase: PhaseId) -> Self {
        Self {
            name: desc.name,
            phase,
            interval: desc.interval,
            multi_threaded: desc.multi_threaded,
            query: Query::new(desc.filter),
            run: desc.run,
            accumulator: 0.0,
            paused: false,
            failed: false,
            stats: SystemStats::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn phase(&self) -> PhaseId {
        self.phase
    }

    #[inline]
    pub fn paused(&self) -> bool {
        self.paused
    }

    #[inline]
    pub fn stats(&self) -> &SystemStats {
        &self.stats
    }

    /// Whether this system is due this tick given its interval budget.
    pub(crate) fn due(&self) -> bool {
        !self.paused && !self.failed && self.interval.is_none_or(|i| self.accumulator >= i)
    }

    /// Consume the interval budget after a run.
    pub(crate) fn consume_interval(&mut self) {
        if let Some(interval) = self.interval {
            self.accumulator -= interval;
        }
    }

    /// The batches this system will process this tick. A term-less filter
    /// yields a single empty batch so the callback still runs.
    pub(crate) fn collect_batches(&self, world: &World) -> Vec<Vec<Entity>> {
        if !self.query.filter().has_terms() {
            return vec![Vec::new()];
        }
        let mut batches = Vec::new();
        self.query
            .for_each_batch(world.store(), |batch| batches.push(batch.to_vec()));
        batches
    }
}

/// Run one batch through a callback, catching panics and accumulating
/// timing. Shared by the inline and worker execution paths.
pub(crate) fn run_batch(
    run: &SystemFn,
    name: &str,
    world: &World,
    entities: &[Entity],
    delta: f32,
    tick: u64,
    panicked: &AtomicBool,
    nanos: &AtomicU64,
) {
    if panicked.load(Ordering::Relaxed) {
        return;
    }
    let start = Instant::now();
    let mut iter = Iter::new(world, entities, delta, tick);
    let outcome = catch_unwind(AssertUnwindSafe(|| (run)(&mut iter)));
    nanos.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    if outcome.is_err() {
        panicked.store(true, Ordering::Relaxed);
        log::error!("system `{name}` panicked; disabled for the remainder of the tick");
    }
}

/// Post-run bookkeeping shared by both execution paths.
pub(crate) fn finish_run(
    system: &mut System,
    tick: u64,
    entity_count: u64,
    panicked: bool,
    nanos: u64,
) {
    system.query.mark_run(tick);
    system.consume_interval();
    system.failed = panicked;
    system.stats.record(nanos / 1_000, entity_count);
}
