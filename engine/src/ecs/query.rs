//! Compiled filters over the component store.
//!
//! A [`Filter`] names four component sets (`read`, `write`, `with`,
//! `without`) plus an optional `detect_changes` marker. Building a filter is
//! deterministic (term lists are kept sorted), so identical filters compare
//! equal and share cached internals in the world's query cache.
//!
//! Execution walks the *driver* column, the smallest dense column among the
//! required terms, and probes the remaining terms through their sparse
//! indices, yielding entity batches of at most [`BATCH_SIZE`]. Batches are
//! independent, which is what lets `multi_threaded` systems fan them out to
//! the worker pool.
//!
//! The [`Access`] mask derived from a filter is the scheduler's conflict
//! currency: two systems may overlap in a phase iff neither's write set
//! intersects the other's read ∪ write set.

use fixedbitset::FixedBitSet;

use crate::ecs::component::ComponentId;
use crate::ecs::entity::Entity;
use crate::ecs::storage::Store;

/// Maximum entities per yielded batch.
pub const BATCH_SIZE: usize = 256;

/// What a system touches, as bitsets over component ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Access {
    read: FixedBitSet,
    write: FixedBitSet,
}

impl Access {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&mut self, id: ComponentId) {
        self.read.grow(id.index() + 1);
        self.read.insert(id.index());
    }

    pub fn add_write(&mut self, id: ComponentId) {
        self.write.grow(id.index() + 1);
        self.write.insert(id.index());
    }

    /// True if the two accesses cannot run concurrently: either side writes
    /// something the other reads or writes.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        !self.write.is_disjoint(&other.write)
            || !self.write.is_disjoint(&other.read)
            || !self.read.is_disjoint(&other.write)
    }

    pub fn reads(&self) -> impl Iterator<Item = usize> + '_ {
        self.read.ones()
    }

    pub fn writes(&self) -> impl Iterator<Item = usize> + '_ {
        self.write.ones()
    }
}

/// A declarative description of the entities a system operates on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    read: Vec<ComponentId>,
    write: Vec<ComponentId>,
    /// Declared read access without a membership requirement; used for
    /// cross-entity reads (a camera's projection, a parent's bounds).
    read_optional: Vec<ComponentId>,
    with: Vec<ComponentId>,
    without: Vec<ComponentId>,
    detect_changes: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the component and declare read access to its column.
    pub fn read(mut self, id: ComponentId) -> Self {
        insert_sorted(&mut self.read, id);
        self
    }

    /// Require the component and declare write access to its column.
    pub fn write(mut self, id: ComponentId) -> Self {
        insert_sorted(&mut self.write, id);
        self
    }

    /// Declare read access to a column without requiring membership. The
    /// scheduler sees the access; matching ignores it.
    pub fn read_optional(mut self, id: ComponentId) -> Self {
        insert_sorted(&mut self.read_optional, id);
        self
    }

    /// Require presence without data access (tags).
    pub fn with(mut self, id: ComponentId) -> Self {
        insert_sorted(&mut self.with, id);
        self
    }

    /// Require absence.
    pub fn without(mut self, id: ComponentId) -> Self {
        insert_sorted(&mut self.without, id);
        self
    }

    /// Restrict results to entities whose `read`/`write` columns changed
    /// since this query last ran.
    pub fn detect_changes(mut self) -> Self {
        self.detect_changes = true;
        self
    }

    #[inline]
    pub fn detects_changes(&self) -> bool {
        self.detect_changes
    }

    /// All terms that must be present, in deterministic order.
    pub fn required(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.read
            .iter()
            .chain(self.write.iter())
            .chain(self.with.iter())
            .copied()
    }

    /// Columns consulted for change detection.
    pub fn tracked(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.read.iter().chain(self.write.iter()).copied()
    }

    pub fn excluded(&self) -> &[ComponentId] {
        &self.without
    }

    /// Whether the filter has any positive term at all. Term-less filters
    /// match no entities; the scheduler still runs their systems once per
    /// tick with an empty iterator.
    pub fn has_terms(&self) -> bool {
        !(self.read.is_empty() && self.write.is_empty() && self.with.is_empty())
    }

    /// The scheduler access mask for this filter.
    pub fn access(&self) -> Access {
        let mut access = Access::new();
        for &id in self.read.iter().chain(&self.read_optional) {
            access.add_read(id);
        }
        for &id in &self.write {
            access.add_write(id);
        }
        access
    }
}

fn insert_sorted(terms: &mut Vec<ComponentId>, id: ComponentId) {
    if let Err(at) = terms.binary_search(&id) {
        terms.insert(at, id);
    }
}

/// A compiled, cached query: filter plus derived access plus the tick it
/// last executed at (the reference point for `detect_changes`).
pub struct Query {
    filter: Filter,
    access: Access,
    last_run: u64,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        let access = filter.access();
        Self {
            filter,
            access,
            last_run: 0,
        }
    }

    #[inline]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    #[inline]
    pub fn access(&self) -> &Access {
        &self.access
    }

    #[inline]
    pub fn last_run(&self) -> u64 {
        self.last_run
    }

    /// Record that the query executed at `tick`; subsequent `detect_changes`
    /// runs only see mutations after this point.
    pub fn mark_run(&mut self, tick: u64) {
        self.last_run = tick;
    }

    /// Whether `entity` satisfies the filter right now.
    pub fn matches(&self, store: &Store, entity: Entity) -> bool {
        for id in self.filter.required() {
            if !store.column(id).is_some_and(|c| c.contains(entity)) {
                return false;
            }
        }
        for &id in self.filter.excluded() {
            if store.column(id).is_some_and(|c| c.contains(entity)) {
                return false;
            }
        }
        if self.filter.detects_changes() && !self.entity_changed(store, entity) {
            return false;
        }
        true
    }

    fn entity_changed(&self, store: &Store, entity: Entity) -> bool {
        self.filter.tracked().any(|id| {
            store
                .column(id)
                .is_some_and(|c| c.changed_since(entity, self.last_run))
        })
    }

    /// Every matching entity, in driver-column order.
    pub fn collect(&self, store: &Store) -> Vec<Entity> {
        let mut out = Vec::new();
        self.for_each_batch(store, |batch| out.extend_from_slice(batch));
        out
    }

    /// Number of matching entities.
    pub fn count(&self, store: &Store) -> usize {
        let mut count = 0;
        self.for_each_batch(store, |batch| count += batch.len());
        count
    }

    /// Yield matching entities in batches of at most [`BATCH_SIZE`].
    pub fn for_each_batch(&self, store: &Store, mut f: impl FnMut(&[Entity])) {
        let Some(driver) = self.driver(store) else {
            return;
        };

        if self.filter.detects_changes() {
            // Column counters short-circuit a fully quiet result set.
            let any_changed = self.filter.tracked().any(|id| {
                store
                    .column(id)
                    .is_some_and(|c| c.column_changed_since(self.last_run))
            });
            if !any_changed {
                return;
            }
        }

        let mut batch = Vec::with_capacity(BATCH_SIZE);
        for &entity in store.column(driver).map(|c| c.entities()).unwrap_or(&[]) {
            if self.matches(store, entity) {
                batch.push(entity);
                if batch.len() == BATCH_SIZE {
                    f(&batch);
                    batch.clear();
                }
            }
        }
        if !batch.is_empty() {
            f(&batch);
        }
    }

    /// The smallest required column; iteration is driven from it so probes
    /// run against the narrower sets.
    fn driver(&self, store: &Store) -> Option<ComponentId> {
        self.filter
            .required()
            .min_by_key(|&id| store.column(id).map_or(usize::MAX, |c| c.len()))
    }
}
